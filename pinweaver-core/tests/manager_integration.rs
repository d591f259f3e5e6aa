//! On-disk manager scenarios: restarts, directory ownership and config.

mod common;

use std::fs;

use pinweaver_core::backend::{ManualClock, PinWeaverBackend};
use pinweaver_core::storage::StorageError;
use pinweaver_core::{
    DelaySchedule, Label, ManagerState, PinWeaverConfig, PinWeaverError, PinWeaverManager,
    ResetType, SharedPinWeaverManager, SoftwareBackend, StoragePaths, TreeStorage,
};

#[test]
fn test_le1_le2_scenario() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = ManualClock::new(common::START);
    let mut manager = common::open_manager(dir.path(), &clock);

    let label1 = manager
        .insert_credential(&[], b"le1", b"he1", b"r1", &DelaySchedule::new(), None)
        .expect("insert label1");
    let label2 = manager
        .insert_credential(&[], b"le2", b"he2", b"r1", &DelaySchedule::new(), None)
        .expect("insert label2");

    assert!(matches!(
        manager.check_credential(label1, b"le2"),
        Err(PinWeaverError::WrongSecret)
    ));
    let reply = manager
        .check_credential(label2, b"le2")
        .expect("check label2");
    assert_eq!(reply.he_secret.as_slice(), b"he2");
}

#[test]
fn test_state_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = ManualClock::new(common::START);

    let label = {
        let mut manager = common::open_manager(dir.path(), &clock);
        let label = manager
            .insert_credential(
                &[],
                b"1234",
                b"he",
                b"reset",
                &DelaySchedule::lockout_after(5),
                Some(3600),
            )
            .expect("insert");
        assert!(matches!(
            manager.check_credential(label, b"0000"),
            Err(PinWeaverError::WrongSecret)
        ));
        label
    };

    let paths = StoragePaths::new(dir.path());
    assert!(paths.leaf_file_path().exists());
    assert!(paths.backend_dir().join("state.cbor").exists());

    let mut manager = common::open_manager(dir.path(), &clock);
    assert_eq!(manager.list_labels().expect("labels"), vec![label]);
    assert_eq!(manager.get_wrong_auth_attempts(label).expect("attempts"), 1);
    assert_eq!(
        manager.get_expiration_in_seconds(label).expect("expiration"),
        Some(3600)
    );
    let reply = manager.check_credential(label, b"1234").expect("check");
    assert_eq!(reply.he_secret.as_slice(), b"he");
}

#[test]
fn test_tree_directory_is_exclusive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = ManualClock::new(common::START);
    let paths = StoragePaths::new(dir.path());

    let manager = common::open_manager(dir.path(), &clock);
    assert!(matches!(
        TreeStorage::open_dir(&paths),
        Err(StorageError::AlreadyLocked)
    ));

    drop(manager);
    let storage = TreeStorage::open_dir(&paths).expect("lock released");
    assert!(storage.is_locked());
}

#[test]
fn test_config_file_sets_geometry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = StoragePaths::new(dir.path());
    fs::write(
        paths.config_path(),
        r#"{ "bits_per_level": 1, "height": 2, "retry_delay_ms": 0 }"#,
    )
    .expect("write config");

    let config = PinWeaverConfig::load_or_default(&paths.config_path()).expect("load config");
    assert_eq!(config.geometry().leaf_count(), 4);

    let backend = SoftwareBackend::open_dir(&paths).expect("backend");
    let storage = TreeStorage::open_dir(&paths).expect("storage");
    let mut manager = PinWeaverManager::new(backend, storage, config).expect("manager");
    manager.init().expect("init");

    for expected in 0..4 {
        assert_eq!(common::insert(&mut manager, b"pin", b"he"), Label(expected));
    }
    assert!(matches!(
        manager.insert_credential(&[], b"pin", b"he", b"reset", &DelaySchedule::new(), None),
        Err(PinWeaverError::ResourceExhausted)
    ));

    // The backend was provisioned with the same shape.
    let root = manager.root_hash().expect("root");
    let mut backend = manager.into_backend();
    assert_eq!(backend.get_root_hash().expect("backend root"), root);
}

#[test]
fn test_shared_manager_on_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = ManualClock::new(common::START);
    let shared = SharedPinWeaverManager::from(common::open_manager(dir.path(), &clock));

    let label = shared
        .insert_credential(&[], b"1234", b"he", b"reset", &DelaySchedule::lockout_after(1), None)
        .expect("insert");
    assert!(matches!(
        shared.check_credential(label, b"0000"),
        Err(PinWeaverError::WrongSecret)
    ));
    assert!(matches!(
        shared.check_credential(label, b"1234"),
        Err(PinWeaverError::LockedOut { .. })
    ));
    shared
        .reset_credential(label, b"reset", ResetType::WrongAttempts)
        .expect("reset");
    shared.check_credential(label, b"1234").expect("check");
    shared.remove_credential(label).expect("remove");
    assert!(shared.list_labels().expect("labels").is_empty());

    let manager = shared.into_inner().expect("unwrap");
    assert_eq!(manager.state(), ManagerState::Ready);
}

#[test]
fn test_leaf_file_stays_bounded_under_repeated_checks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = ManualClock::new(common::START);
    let mut manager = common::open_manager(dir.path(), &clock);

    let labels: Vec<Label> = (0..32u8)
        .map(|i| common::insert(&mut manager, &[i; 4], &[i]))
        .collect();
    let leaf_file = common::leaf_file(dir.path());
    let after_inserts = fs::metadata(&leaf_file).expect("leaf file").len();

    let mut largest = after_inserts;
    for round in 0..200usize {
        let label = labels[round % labels.len()];
        manager
            .check_credential(label, &label_secret(label))
            .expect("check");
        largest = largest.max(fs::metadata(&leaf_file).expect("leaf file").len());
    }
    assert!(
        largest < 4 * after_inserts.max(64 * 1024),
        "leaf file reached {largest} bytes"
    );

    drop(manager);
    let mut manager = common::open_manager(dir.path(), &clock);
    assert_eq!(manager.list_labels().expect("labels"), labels);
    for label in labels {
        manager
            .check_credential(label, &label_secret(label))
            .expect("check after restart");
    }
}

fn label_secret(label: Label) -> [u8; 4] {
    [u8::try_from(label.0).expect("small label"); 4]
}
