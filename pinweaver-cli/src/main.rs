//! `pinweaver`: drive a PinWeaver credential tree from the shell.
//!
//! State lives under `--dir`: the host tree, the software backend standing
//! in for the secure element, and an optional `config.json`. Every command
//! prints a single status line on success.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use eyre::{eyre, WrapErr};
use pinweaver_core::logger::{init_logging, DEFAULT_FILTER};
use pinweaver_core::{
    Delay, DelaySchedule, Label, PinWeaverConfig, PinWeaverManager, ResetType, SoftwareBackend,
    StoragePaths, TreeStorage,
};
use tracing::debug;

/// `EX_USAGE` from `sysexits.h`.
const EX_USAGE: u8 = 64;

#[derive(Parser, Debug)]
#[command(name = "pinweaver", version, about, long_about = None)]
struct Cli {
    /// Directory holding the tree, the backend state and config.json.
    /// Defaults to `<data_local_dir>/pinweaver`.
    #[arg(long, env = "PINWEAVER_DIR", global = true)]
    dir: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision the tree, or open an existing one.
    Init {
        /// Discard every credential and start from an empty tree.
        #[arg(long)]
        force: bool,
    },

    /// Bring the local tree in line with the backend.
    Sync,

    /// Insert a credential and print its label.
    Insert {
        /// Low-entropy secret (the PIN).
        le: String,
        /// High-entropy secret released on success.
        he: String,
        /// Secret that clears the wrong-attempt counter.
        reset: String,
        /// Delay after N wrong attempts, as `N:SECS` or `N:inf`. Repeatable.
        #[arg(long = "delay", value_name = "N:SECS", value_parser = parse_delay)]
        delays: Vec<(u32, Delay)>,
        /// Seconds after insertion (or a strong reset) the credential expires.
        #[arg(long, value_name = "SECS")]
        expiration: Option<u32>,
    },

    /// Check a low-entropy secret and print the released high-entropy secret.
    Auth {
        /// Leaf label.
        label: u64,
        /// Low-entropy secret.
        le: String,
    },

    /// Clear the wrong-attempt counter with the reset secret.
    Reset {
        /// Leaf label.
        label: u64,
        /// Reset secret.
        reset: String,
        /// Also restart the expiration window.
        #[arg(long)]
        strong: bool,
    },

    /// Remove a credential.
    Remove {
        /// Leaf label.
        label: u64,
    },

    /// Show the counter, delay, expiration and schedule of a credential.
    Info {
        /// Leaf label.
        label: u64,
    },
}

impl Cli {
    fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => DEFAULT_FILTER,
            2 => "pinweaver_core=debug,pinweaver=debug,info",
            _ => "trace",
        }
    }

    fn root_dir(&self) -> eyre::Result<PathBuf> {
        self.dir
            .clone()
            .or_else(|| dirs::data_local_dir().map(|dir| dir.join("pinweaver")))
            .ok_or_else(|| eyre!("no local data directory on this platform, pass --dir"))
    }
}

fn parse_delay(value: &str) -> Result<(u32, Delay), String> {
    let (attempts, delay) = value
        .split_once(':')
        .ok_or_else(|| format!("expected N:SECS or N:inf, got `{value}`"))?;
    let attempts: u32 = attempts
        .parse()
        .map_err(|e| format!("invalid attempt count `{attempts}`: {e}"))?;
    if attempts == 0 {
        return Err("attempt count must be at least 1".to_string());
    }
    let delay = if delay.eq_ignore_ascii_case("inf") {
        Delay::Infinite
    } else {
        Delay::Seconds(
            delay
                .parse()
                .map_err(|e| format!("invalid delay `{delay}`: {e}"))?,
        )
    };
    Ok((attempts, delay))
}

fn open_manager(root: &Path) -> eyre::Result<PinWeaverManager<SoftwareBackend>> {
    let paths = StoragePaths::new(root);
    let config = PinWeaverConfig::load_or_default(&paths.config_path())
        .wrap_err("loading config.json")?;
    let backend = SoftwareBackend::open_dir(&paths)
        .wrap_err("opening backend state")?
        .with_log_capacity(config.log_capacity);
    let storage = TreeStorage::open_dir(&paths).wrap_err("opening tree storage")?;
    PinWeaverManager::new(backend, storage, config).wrap_err("creating manager")
}

fn run(cli: &Cli) -> eyre::Result<String> {
    let root = cli.root_dir()?;
    debug!(root = %root.display(), "opening pinweaver state");
    let mut manager = open_manager(&root)?;

    // A forced init must work on a tree that `init` refuses to open.
    if matches!(cli.command, Commands::Init { force: true }) {
        manager.reset_tree().wrap_err("resetting tree")?;
    } else {
        manager.init().wrap_err("initializing")?;
    }

    match &cli.command {
        Commands::Init { .. } => {
            let root_hash = manager.root_hash()?;
            Ok(format!(
                "initialized {} (root {})",
                root.display(),
                hex::encode(root_hash)
            ))
        }
        Commands::Sync => {
            manager.sync_hash_tree().wrap_err("syncing")?;
            Ok(format!("in sync (root {})", hex::encode(manager.root_hash()?)))
        }
        Commands::Insert {
            le,
            he,
            reset,
            delays,
            expiration,
        } => {
            let schedule: DelaySchedule = delays.iter().copied().collect();
            let label = manager
                .insert_credential(
                    &[],
                    le.as_bytes(),
                    he.as_bytes(),
                    reset.as_bytes(),
                    &schedule,
                    *expiration,
                )
                .wrap_err("inserting credential")?;
            Ok(format!("inserted label {label}"))
        }
        Commands::Auth { label, le } => {
            let label = Label::from(*label);
            let reply = manager
                .check_credential(label, le.as_bytes())
                .wrap_err_with(|| format!("authenticating label {label}"))?;
            Ok(format!(
                "authenticated label {label}: he secret {}",
                hex::encode(reply.he_secret.as_slice())
            ))
        }
        Commands::Reset {
            label,
            reset,
            strong,
        } => {
            let label = Label::from(*label);
            let reset_type = if *strong {
                ResetType::WrongAttemptsAndExpiration
            } else {
                ResetType::WrongAttempts
            };
            manager
                .reset_credential(label, reset.as_bytes(), reset_type)
                .wrap_err_with(|| format!("resetting label {label}"))?;
            Ok(format!("reset label {label} ({reset_type})"))
        }
        Commands::Remove { label } => {
            let label = Label::from(*label);
            manager
                .remove_credential(label)
                .wrap_err_with(|| format!("removing label {label}"))?;
            Ok(format!("removed label {label}"))
        }
        Commands::Info { label } => {
            let label = Label::from(*label);
            let attempts = manager.get_wrong_auth_attempts(label)?;
            let delay = Delay::from(manager.get_delay_in_seconds(label)?);
            let expiration = manager
                .get_expiration_in_seconds(label)?
                .map_or_else(|| "never".to_string(), |secs| format!("{secs}s"));
            let schedule = manager.get_delay_schedule(label)?;
            Ok(format!(
                "label {label}: wrong attempts {attempts}, delay {delay}, expires in {expiration}, schedule {schedule}"
            ))
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version go to stdout and are not errors.
            let code = if err.use_stderr() {
                ExitCode::from(EX_USAGE)
            } else {
                ExitCode::SUCCESS
            };
            let _ = err.print();
            return code;
        }
    };

    init_logging(Some(cli.log_filter()));

    match run(&cli) {
        Ok(status) => {
            println!("{status}");
            ExitCode::SUCCESS
        }
        Err(report) => {
            eprintln!("error: {report:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_delay() {
        assert_eq!(parse_delay("3:30"), Ok((3, Delay::Seconds(30))));
        assert_eq!(parse_delay("10:inf"), Ok((10, Delay::Infinite)));
        assert_eq!(parse_delay("10:INF"), Ok((10, Delay::Infinite)));
        assert!(parse_delay("0:30").is_err());
        assert!(parse_delay("3").is_err());
        assert!(parse_delay("x:30").is_err());
        assert!(parse_delay("3:soon").is_err());
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_insert_arguments() {
        let cli = Cli::try_parse_from([
            "pinweaver",
            "--dir",
            "/tmp/pw",
            "insert",
            "1234",
            "he",
            "rs",
            "--delay",
            "3:30",
            "--delay",
            "5:inf",
            "--expiration",
            "600",
        ])
        .expect("parse");
        assert_eq!(cli.dir.as_deref(), Some(Path::new("/tmp/pw")));
        match cli.command {
            Commands::Insert {
                delays, expiration, ..
            } => {
                assert_eq!(delays, vec![(3, Delay::Seconds(30)), (5, Delay::Infinite)]);
                assert_eq!(expiration, Some(600));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_verbosity_selects_filter() {
        let quiet = Cli::try_parse_from(["pinweaver", "sync"]).expect("parse");
        assert_eq!(quiet.log_filter(), "warn");
        let loud = Cli::try_parse_from(["pinweaver", "-vv", "sync"]).expect("parse");
        assert_eq!(loud.log_filter(), "pinweaver_core=debug,pinweaver=debug,info");
    }

    #[test]
    fn test_bad_label_is_a_usage_error() {
        let err = Cli::try_parse_from(["pinweaver", "auth", "abc", "1234"]).unwrap_err();
        assert!(err.use_stderr());
    }
}
