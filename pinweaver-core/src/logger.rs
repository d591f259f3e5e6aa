//! Process-wide logging setup.
//!
//! The library emits `tracing` events. Hosts that want them on stderr call
//! [`init_logging`] once; `log` records from dependencies are bridged into
//! the same subscriber.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, EnvFilter};

/// Directive used when neither `RUST_LOG` nor an explicit filter is set.
pub const DEFAULT_FILTER: &str = "pinweaver_core=info,pinweaver=info,warn";

static INIT: OnceLock<()> = OnceLock::new();

/// Installs a `fmt` subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence over `filter`; `filter` falls back to
/// [`DEFAULT_FILTER`] when `None`. Calling this more than once is harmless:
/// only the first call installs anything.
pub fn init_logging(filter: Option<&str>) {
    INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(filter.unwrap_or(DEFAULT_FILTER)));

        let subscriber = fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .finish();

        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("Failed to set tracing subscriber: {e}");
            return;
        }

        // Route `log` records from dependencies into the subscriber.
        if let Err(e) = tracing_log::LogTracer::builder()
            .with_max_level(log::LevelFilter::Trace)
            .init()
        {
            eprintln!("Failed to bridge log records: {e}");
        }
    });
}
