//! Common test utilities shared across integration tests.

use std::path::Path;

use pinweaver_core::backend::{ManualClock, SoftwareBackend};
use pinweaver_core::{
    DelaySchedule, Label, PinWeaverConfig, PinWeaverManager, StoragePaths, TreeStorage,
};

/// Fixed starting timestamp for the manual clock.
pub const START: u64 = 1_700_000_000;

/// Test configuration with retry delay disabled.
pub fn config() -> PinWeaverConfig {
    PinWeaverConfig {
        retry_delay_ms: 0,
        ..PinWeaverConfig::default()
    }
}

/// Opens the tree and the software backend under `root` and initializes a
/// manager over them.
pub fn open_manager(root: &Path, clock: &ManualClock) -> PinWeaverManager<SoftwareBackend> {
    let paths = StoragePaths::new(root);
    let backend = SoftwareBackend::open_dir(&paths)
        .expect("open backend")
        .with_clock(clock.clone());
    let storage = TreeStorage::open_dir(&paths).expect("open tree storage");
    let mut manager = PinWeaverManager::new(backend, storage, config()).expect("create manager");
    manager.init().expect("init manager");
    manager
}

#[allow(dead_code, reason = "used in tests")]
/// Inserts a credential and returns its label.
pub fn insert(manager: &mut PinWeaverManager<SoftwareBackend>, le: &[u8], he: &[u8]) -> Label {
    manager
        .insert_credential(&[], le, he, b"reset", &DelaySchedule::new(), None)
        .expect("insert credential")
}

#[allow(dead_code, reason = "used in tests")]
/// Returns the path of the leaf storage file under `root`.
pub fn leaf_file(root: &Path) -> std::path::PathBuf {
    StoragePaths::new(root).leaf_file_path()
}
