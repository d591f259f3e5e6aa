use std::sync::Arc;

use x25519_dalek::{PublicKey, StaticSecret};

use super::*;
use crate::backend::software::{decrypt_he_secret, derive_pairing_key, derive_session_key};
use crate::backend::{ManualClock, SoftwareBackend};
use crate::hash_tree::{empty_root, TreeGeometry};
use crate::storage::{MemoryBlobStore, MemoryLeafFileStore};
use crate::types::Delay;

const START: u64 = 1_700_000_000;

/// In-memory stores and a clock shared by every manager built from it.
struct Harness {
    leaf_store: Arc<MemoryLeafFileStore>,
    cache_store: Arc<MemoryBlobStore>,
    clock: ManualClock,
}

impl Harness {
    fn new() -> Self {
        Self::with_leaf_store(MemoryLeafFileStore::new(), ManualClock::new(START))
    }

    fn with_leaf_store(leaf_store: MemoryLeafFileStore, clock: ManualClock) -> Self {
        Self {
            leaf_store: Arc::new(leaf_store),
            cache_store: Arc::new(MemoryBlobStore::new()),
            clock,
        }
    }

    /// Tree storage as it was when `snapshot` was taken.
    fn restored(&self, snapshot: Vec<u8>) -> Self {
        Self::with_leaf_store(MemoryLeafFileStore::with_data(snapshot), self.clock.clone())
    }

    fn backend(&self) -> SoftwareBackend {
        SoftwareBackend::new().with_clock(self.clock.clone())
    }

    fn config() -> PinWeaverConfig {
        PinWeaverConfig {
            retry_delay_ms: 0,
            ..PinWeaverConfig::default()
        }
    }

    fn storage(&self) -> TreeStorage {
        TreeStorage::new(self.leaf_store.clone(), self.cache_store.clone())
    }

    fn uninitialized(&self, backend: SoftwareBackend) -> PinWeaverManager<SoftwareBackend> {
        PinWeaverManager::new(backend, self.storage(), Self::config()).unwrap()
    }

    fn manager(&self, backend: SoftwareBackend) -> PinWeaverManager<SoftwareBackend> {
        let mut manager = self.uninitialized(backend);
        manager.init().unwrap();
        manager
    }

    fn snapshot(&self) -> Vec<u8> {
        self.leaf_store.snapshot().unwrap()
    }
}

fn insert(manager: &mut PinWeaverManager<SoftwareBackend>, le: &[u8], he: &[u8]) -> Label {
    manager
        .insert_credential(&[], le, he, b"reset", &DelaySchedule::new(), None)
        .unwrap()
}

fn assert_in_sync(manager: &mut PinWeaverManager<SoftwareBackend>) {
    let local = manager.root_hash().unwrap();
    assert_eq!(manager.backend_mut().get_root_hash().unwrap(), local);
}

#[test]
fn test_init_provisions_backend() {
    let harness = Harness::new();
    let mut manager = harness.uninitialized(harness.backend());
    assert_eq!(manager.state(), ManagerState::Uninitialized);
    assert!(matches!(
        manager.list_labels(),
        Err(PinWeaverError::NotInitialized)
    ));

    manager.init().unwrap();
    assert_eq!(manager.state(), ManagerState::Ready);
    assert_eq!(
        manager.root_hash().unwrap(),
        empty_root(TreeGeometry::default())
    );
    assert_in_sync(&mut manager);

    // Idempotent.
    manager.init().unwrap();
    assert_eq!(manager.state(), ManagerState::Ready);
}

#[test]
fn test_invalid_config_is_rejected() {
    let harness = Harness::new();
    let config = PinWeaverConfig {
        bits_per_level: 9,
        ..PinWeaverConfig::default()
    };
    assert!(matches!(
        PinWeaverManager::new(harness.backend(), harness.storage(), config),
        Err(PinWeaverError::Config(_))
    ));
}

#[test]
fn test_credential_round_trip() {
    let harness = Harness::new();
    let mut manager = harness.manager(harness.backend());
    let label = insert(&mut manager, b"1234", b"high entropy");
    assert_eq!(label, Label(0));
    assert_in_sync(&mut manager);

    let reply = manager.check_credential(label, b"1234").unwrap();
    assert_eq!(reply.he_secret.as_slice(), b"high entropy");
    assert_eq!(reply.reset_secret.as_slice(), b"reset");

    assert!(matches!(
        manager.check_credential(label, b"4321"),
        Err(PinWeaverError::WrongSecret)
    ));
    assert_eq!(manager.get_wrong_auth_attempts(label).unwrap(), 1);

    manager.check_credential(label, b"1234").unwrap();
    assert_eq!(manager.get_wrong_auth_attempts(label).unwrap(), 0);
    assert_in_sync(&mut manager);
}

#[test]
fn test_attempt_exhaustion() {
    let harness = Harness::new();
    let mut manager = harness.manager(harness.backend());
    let schedule = DelaySchedule::lockout_after(3);
    let label = manager
        .insert_credential(&[], b"1234", b"he", b"reset", &schedule, None)
        .unwrap();
    assert_eq!(manager.get_delay_schedule(label).unwrap(), schedule);

    for _ in 0..3 {
        assert!(matches!(
            manager.check_credential(label, b"0000"),
            Err(PinWeaverError::WrongSecret)
        ));
    }
    assert!(matches!(
        manager.check_credential(label, b"1234"),
        Err(PinWeaverError::LockedOut {
            delay_seconds: u32::MAX
        })
    ));
    assert_eq!(manager.get_delay_in_seconds(label).unwrap(), u32::MAX);
    assert_eq!(manager.get_wrong_auth_attempts(label).unwrap(), 3);
}

#[test]
fn test_timed_delay_reported() {
    let harness = Harness::new();
    let mut manager = harness.manager(harness.backend());
    let schedule = DelaySchedule::new().with(1, Delay::Seconds(60));
    let label = manager
        .insert_credential(&[], b"1234", b"he", b"reset", &schedule, None)
        .unwrap();

    let _ = manager.check_credential(label, b"0000");
    harness.clock.advance(20);
    assert_eq!(manager.get_delay_in_seconds(label).unwrap(), 40);
    assert!(matches!(
        manager.check_credential(label, b"1234"),
        Err(PinWeaverError::LockedOut { delay_seconds: 40 })
    ));

    harness.clock.advance(40);
    manager.check_credential(label, b"1234").unwrap();
}

#[test]
fn test_wrong_reset_keeps_lockout() {
    let harness = Harness::new();
    let mut manager = harness.manager(harness.backend());
    let label = manager
        .insert_credential(&[], b"1234", b"he", b"reset", &DelaySchedule::lockout_after(1), None)
        .unwrap();
    let _ = manager.check_credential(label, b"0000");

    assert!(matches!(
        manager.reset_credential(label, b"not it", ResetType::WrongAttempts),
        Err(PinWeaverError::WrongSecret)
    ));
    assert!(matches!(
        manager.check_credential(label, b"1234"),
        Err(PinWeaverError::LockedOut { .. })
    ));
    assert_eq!(manager.get_wrong_auth_attempts(label).unwrap(), 1);

    manager
        .reset_credential(label, b"reset", ResetType::WrongAttempts)
        .unwrap();
    manager.check_credential(label, b"1234").unwrap();
}

#[test]
fn test_removal_is_final() {
    let harness = Harness::new();
    let mut manager = harness.manager(harness.backend());
    let label = insert(&mut manager, b"1234", b"he");

    manager.remove_credential(label).unwrap();
    assert!(matches!(
        manager.check_credential(label, b"1234"),
        Err(PinWeaverError::NotFound { .. })
    ));
    assert!(matches!(
        manager.get_wrong_auth_attempts(label),
        Err(PinWeaverError::NotFound { .. })
    ));
    assert!(matches!(
        manager.remove_credential(label),
        Err(PinWeaverError::NotFound { .. })
    ));
    assert_eq!(
        manager.root_hash().unwrap(),
        empty_root(TreeGeometry::default())
    );
    assert_in_sync(&mut manager);

    // The slot is reused.
    assert_eq!(insert(&mut manager, b"5678", b"he2"), label);
}

#[test]
fn test_labels_are_isolated() {
    let harness = Harness::new();
    let mut manager = harness.manager(harness.backend());
    let label1 = manager
        .insert_credential(&[], b"le1", b"he1", b"r1", &DelaySchedule::new(), None)
        .unwrap();
    let label2 = manager
        .insert_credential(&[], b"le2", b"he2", b"r1", &DelaySchedule::new(), None)
        .unwrap();
    assert_ne!(label1, label2);

    assert!(matches!(
        manager.check_credential(label1, b"le2"),
        Err(PinWeaverError::WrongSecret)
    ));
    let reply = manager.check_credential(label2, b"le2").unwrap();
    assert_eq!(reply.he_secret.as_slice(), b"he2");
    assert_eq!(manager.get_wrong_auth_attempts(label1).unwrap(), 1);
    assert_eq!(manager.get_wrong_auth_attempts(label2).unwrap(), 0);
}

#[test]
fn test_expiration() {
    let harness = Harness::new();
    let mut manager = harness.manager(harness.backend());
    let never = manager
        .insert_credential(&[], b"1234", b"he", b"reset", &DelaySchedule::new(), Some(0))
        .unwrap();
    let soon = manager
        .insert_credential(&[], b"1234", b"he", b"reset", &DelaySchedule::new(), Some(1))
        .unwrap();

    assert_eq!(manager.get_expiration_in_seconds(never).unwrap(), None);
    assert_eq!(manager.get_expiration_in_seconds(soon).unwrap(), Some(1));

    harness.clock.advance(1);
    assert_eq!(manager.get_expiration_in_seconds(soon).unwrap(), Some(0));
    assert!(matches!(
        manager.check_credential(soon, b"1234"),
        Err(PinWeaverError::Expired)
    ));
    manager.check_credential(never, b"1234").unwrap();

    manager
        .reset_credential(soon, b"reset", ResetType::WrongAttemptsAndExpiration)
        .unwrap();
    manager.check_credential(soon, b"1234").unwrap();
}

#[test]
fn test_policy_mismatch() {
    let harness = Harness::new();
    let mut manager = harness.manager(harness.backend());
    let policy = ValidPcrValue {
        bitmask: [0x01, 0x00],
        digest: vec![1; 32],
    };
    let label = manager
        .insert_credential(
            std::slice::from_ref(&policy),
            b"1234",
            b"he",
            b"reset",
            &DelaySchedule::new(),
            None,
        )
        .unwrap();

    assert!(matches!(
        manager.check_credential(label, b"1234"),
        Err(PinWeaverError::PolicyNotMatch)
    ));
    manager.backend_mut().set_platform_state(Some(policy));
    manager.check_credential(label, b"1234").unwrap();
}

#[test]
fn test_tree_full() {
    let harness = Harness::new();
    let config = PinWeaverConfig {
        bits_per_level: 1,
        height: 1,
        ..Harness::config()
    };
    let mut manager = PinWeaverManager::new(harness.backend(), harness.storage(), config).unwrap();
    manager.init().unwrap();

    insert(&mut manager, b"a", b"a");
    insert(&mut manager, b"b", b"b");
    assert!(matches!(
        manager.insert_credential(&[], b"c", b"c", b"r", &DelaySchedule::new(), None),
        Err(PinWeaverError::ResourceExhausted)
    ));
    assert_eq!(manager.list_labels().unwrap(), vec![Label(0), Label(1)]);
}

#[test]
fn test_rejected_insert_leaves_no_placeholder() {
    let harness = Harness::new();
    let mut manager = harness.manager(harness.backend());
    let root = manager.root_hash().unwrap();

    let bad = DelaySchedule::new().with(0, Delay::Infinite);
    assert!(matches!(
        manager.insert_credential(&[], b"1234", b"he", b"reset", &bad, None),
        Err(PinWeaverError::InvalidArgument { .. })
    ));

    manager.backend_mut().set_available(false);
    assert!(matches!(
        manager.insert_credential(&[], b"1234", b"he", b"reset", &DelaySchedule::new(), None),
        Err(PinWeaverError::BackendUnavailable { .. })
    ));

    assert!(manager.list_labels().unwrap().is_empty());
    assert_eq!(manager.root_hash().unwrap(), root);
    assert_eq!(manager.state(), ManagerState::Ready);
}

#[test]
fn test_init_drops_unfinished_placeholders() {
    let harness = Harness::new();
    let backend = {
        let mut manager = harness.manager(harness.backend());
        insert(&mut manager, b"1234", b"he");
        manager.into_backend()
    };

    // A crash between the placeholder write and the backend call.
    {
        let mut tree = HashTree::open(
            harness.leaf_store.clone(),
            harness.cache_store.clone(),
            TreeGeometry::default(),
        )
        .unwrap();
        tree.store_leaf(Label(1), &[], EMPTY_HASH, true).unwrap();
        assert_eq!(tree.tentative_labels(), vec![Label(1)]);
    }

    let mut manager = harness.manager(backend);
    assert_eq!(manager.list_labels().unwrap(), vec![Label(0)]);
    assert_in_sync(&mut manager);
    assert_eq!(insert(&mut manager, b"5678", b"he"), Label(1));
}

#[test]
fn test_unprovisioned_backend_with_local_leaves() {
    let harness = Harness::new();
    {
        let mut manager = harness.manager(harness.backend());
        insert(&mut manager, b"1234", b"he");
    }

    let mut manager = harness.uninitialized(harness.backend());
    assert!(matches!(
        manager.init(),
        Err(PinWeaverError::FailedPrecondition { .. })
    ));
    assert_eq!(manager.state(), ManagerState::Uninitialized);

    // Recoverable by starting over.
    manager.reset_tree().unwrap();
    assert_eq!(manager.state(), ManagerState::Ready);
    assert!(manager.list_labels().unwrap().is_empty());
    assert_in_sync(&mut manager);
}

#[test]
fn test_reset_tree_wipes_everything() {
    let harness = Harness::new();
    let mut manager = harness.manager(harness.backend());
    let label = insert(&mut manager, b"1234", b"he");

    manager.reset_tree().unwrap();
    assert!(manager.list_labels().unwrap().is_empty());
    assert!(matches!(
        manager.check_credential(label, b"1234"),
        Err(PinWeaverError::NotFound { .. })
    ));
    assert_in_sync(&mut manager);
}

#[test]
fn test_write_failure_locks_manager() {
    let harness = Harness::new();
    let mut manager = harness.manager(harness.backend());
    let label = insert(&mut manager, b"1234", b"he");

    harness.leaf_store.set_fail_writes(true);
    assert!(matches!(
        manager.check_credential(label, b"1234"),
        Err(PinWeaverError::Corruption { .. })
    ));
    assert_eq!(manager.state(), ManagerState::Locked);

    harness.leaf_store.set_fail_writes(false);
    assert!(matches!(
        manager.check_credential(label, b"1234"),
        Err(PinWeaverError::Locked)
    ));
    assert!(matches!(manager.init(), Err(PinWeaverError::Locked)));
    assert!(matches!(
        manager.list_labels(),
        Err(PinWeaverError::Locked)
    ));
}

#[test]
fn test_out_of_sync_operation_replays_and_retries() {
    let harness = Harness::new();
    let mut manager = harness.manager(harness.backend());
    let label = insert(&mut manager, b"1234", b"he");

    // The backend charges an attempt the local tree never hears about.
    let proof = manager.leaf_proof(label).unwrap();
    let reply = manager.backend_mut().check_leaf(&proof, b"0000").unwrap();
    assert!(reply.secrets.is_none());
    assert_eq!(manager.get_wrong_auth_attempts(label).unwrap(), 0);

    manager.check_credential(label, b"1234").unwrap();
    assert_eq!(manager.get_wrong_auth_attempts(label).unwrap(), 0);
    assert_in_sync(&mut manager);
}

#[test]
fn test_sync_hash_tree_applies_missed_update() {
    let harness = Harness::new();
    let mut manager = harness.manager(harness.backend());
    let label = insert(&mut manager, b"1234", b"he");

    let proof = manager.leaf_proof(label).unwrap();
    manager.backend_mut().check_leaf(&proof, b"0000").unwrap();

    manager.sync_hash_tree().unwrap();
    assert_eq!(manager.get_wrong_auth_attempts(label).unwrap(), 1);
    assert_in_sync(&mut manager);

    // Nothing left to do.
    manager.sync_hash_tree().unwrap();
}

#[test]
fn test_replay_restores_agreement() {
    let harness = Harness::new();
    let mut manager = harness.manager(harness.backend());
    let a = insert(&mut manager, b"aaaa", b"he-a");
    let b = insert(&mut manager, b"bbbb", b"he-b");
    let snapshot = harness.snapshot();

    let _ = manager.check_credential(a, b"0000");
    manager.check_credential(b, b"bbbb").unwrap();
    let backend = manager.into_backend();

    let restored = harness.restored(snapshot);
    let mut manager = restored.manager(backend);
    assert_in_sync(&mut manager);
    assert_eq!(manager.get_wrong_auth_attempts(a).unwrap(), 1);
    assert_eq!(
        manager.check_credential(b, b"bbbb").unwrap().he_secret.as_slice(),
        b"he-b"
    );
    manager.check_credential(a, b"aaaa").unwrap();
}

#[test]
fn test_replayed_insert_is_discarded() {
    let harness = Harness::new();
    let mut manager = harness.manager(harness.backend());
    let kept = insert(&mut manager, b"keep", b"he");
    let snapshot = harness.snapshot();
    let lost = insert(&mut manager, b"lost", b"he");
    let backend = manager.into_backend();

    let restored = harness.restored(snapshot);
    let mut manager = restored.manager(backend);
    assert_in_sync(&mut manager);
    assert_eq!(manager.list_labels().unwrap(), vec![kept]);
    assert!(matches!(
        manager.check_credential(lost, b"lost"),
        Err(PinWeaverError::NotFound { .. })
    ));
    manager.check_credential(kept, b"keep").unwrap();
}

#[test]
fn test_lost_insert_then_failed_check_is_discarded() {
    let harness = Harness::new();
    let mut manager = harness.manager(harness.backend());
    let kept = insert(&mut manager, b"keep", b"he");
    let snapshot = harness.snapshot();
    let lost = insert(&mut manager, b"lost", b"he");
    assert!(matches!(
        manager.check_credential(lost, b"bad"),
        Err(PinWeaverError::WrongSecret)
    ));
    let backend = manager.into_backend();

    let restored = harness.restored(snapshot);
    let mut manager = restored.manager(backend);
    assert_eq!(
        manager.check_credential(kept, b"keep").unwrap().he_secret.as_slice(),
        b"he"
    );
    assert!(matches!(
        manager.get_wrong_auth_attempts(lost),
        Err(PinWeaverError::NotFound { .. })
    ));
    assert_eq!(manager.list_labels().unwrap(), vec![kept]);
    assert_in_sync(&mut manager);
}

#[test]
fn test_lost_insert_then_reset_is_discarded() {
    let harness = Harness::new();
    let mut manager = harness.manager(harness.backend());
    let kept = insert(&mut manager, b"keep", b"he");
    let snapshot = harness.snapshot();
    let lost = insert(&mut manager, b"lost", b"he");
    manager
        .reset_credential(lost, b"reset", ResetType::WrongAttempts)
        .unwrap();
    let backend = manager.into_backend();

    let restored = harness.restored(snapshot);
    let mut manager = restored.manager(backend);
    manager.sync_hash_tree().unwrap();
    assert_in_sync(&mut manager);
    assert_eq!(manager.list_labels().unwrap(), vec![kept]);

    // The freed slot is handed out again.
    assert_eq!(insert(&mut manager, b"next", b"he"), lost);
    assert_in_sync(&mut manager);
}

#[test]
fn test_replay_beyond_log_capacity_fails_without_locking() {
    let harness = Harness::new();
    let mut manager = harness.manager(harness.backend());
    let label = insert(&mut manager, b"1234", b"he");
    let snapshot = harness.snapshot();

    for _ in 0..3 {
        let _ = manager.check_credential(label, b"0000");
    }
    let backend = manager.into_backend();

    let restored = harness.restored(snapshot);
    let mut manager = restored.manager(backend);
    assert_eq!(manager.state(), ManagerState::Ready);
    assert!(matches!(
        manager.sync_hash_tree(),
        Err(PinWeaverError::FailedPrecondition { .. })
    ));
    assert!(matches!(
        manager.check_credential(label, b"1234"),
        Err(PinWeaverError::FailedPrecondition { .. })
    ));
    assert_eq!(manager.state(), ManagerState::Ready);
}

#[test]
fn test_rate_limiter_requires_pairing() {
    let harness = Harness::new();
    let mut manager = harness.manager(harness.backend());
    let channel = AuthChannel::Fingerprint;
    let schedule = DelaySchedule::lockout_after(2);

    assert!(matches!(
        manager.insert_rate_limiter(channel, &[], b"reset", &schedule, None),
        Err(PinWeaverError::FailedPrecondition { .. })
    ));
    assert!(manager.list_labels().unwrap().is_empty());

    let client = StaticSecret::from(rand::random::<[u8; 32]>());
    let server_public = manager
        .generate_pk(channel, PublicKey::from(&client).as_bytes())
        .unwrap();
    let pairing_key =
        derive_pairing_key(client.diffie_hellman(&PublicKey::from(server_public)).as_bytes())
            .unwrap();

    let label = manager
        .insert_rate_limiter(channel, &[], b"reset", &schedule, None)
        .unwrap();
    let nonce = [3u8; 32];
    let reply = manager
        .start_biometrics_auth(channel, label, &nonce)
        .unwrap();
    let session = derive_session_key(&pairing_key, &nonce, &reply.server_nonce).unwrap();
    let he = decrypt_he_secret(&session, &reply.iv, &reply.encrypted_he_secret).unwrap();
    assert_eq!(he.len(), 32);
    assert_eq!(manager.get_wrong_auth_attempts(label).unwrap(), 1);

    // The verifier matched: report it by resetting the limiter.
    manager
        .reset_credential(label, b"reset", ResetType::WrongAttempts)
        .unwrap();
    assert_eq!(manager.get_wrong_auth_attempts(label).unwrap(), 0);

    manager.start_biometrics_auth(channel, label, &nonce).unwrap();
    manager.start_biometrics_auth(channel, label, &nonce).unwrap();
    assert!(matches!(
        manager.start_biometrics_auth(channel, label, &nonce),
        Err(PinWeaverError::LockedOut { .. })
    ));
    assert_in_sync(&mut manager);
}

#[test]
fn test_shared_manager_across_threads() {
    let harness = Harness::new();
    let shared = Arc::new(SharedPinWeaverManager::new(
        harness.uninitialized(harness.backend()),
    ));
    shared.init().unwrap();

    let handles: Vec<_> = (0..4u8)
        .map(|i| {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                let le = [i; 4];
                let label = shared
                    .insert_credential(&[], &le, &[i], b"reset", &DelaySchedule::new(), None)
                    .unwrap();
                let reply = shared.check_credential(label, &le).unwrap();
                assert_eq!(reply.he_secret.as_slice(), &[i]);
                label
            })
        })
        .collect();

    let mut labels: Vec<Label> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    labels.sort();
    assert_eq!(labels, vec![Label(0), Label(1), Label(2), Label(3)]);
    assert_eq!(shared.list_labels().unwrap(), labels);
    assert_eq!(shared.state(), ManagerState::Ready);
}

#[test]
fn test_shared_manager_with_grants_mutable_access() {
    let harness = Harness::new();
    let shared = SharedPinWeaverManager::new(harness.manager(harness.backend()));
    let label = shared.with(|manager| Ok(insert(manager, b"1234", b"he"))).unwrap();

    let backend_root = shared
        .with(|manager| Ok(manager.backend_mut().get_root_hash()?))
        .unwrap();
    assert_eq!(backend_root, shared.root_hash().unwrap());
    assert_eq!(shared.list_labels().unwrap(), vec![label]);

    let shared = Arc::new(shared);
    let poisoner = Arc::clone(&shared);
    let _ = std::thread::spawn(move || {
        let _ = poisoner.with(|_| -> PinWeaverResult<()> { panic!("poison the lock") });
    })
    .join();
    assert!(matches!(shared.with(|_| Ok(())), Err(PinWeaverError::Locked)));
    assert_eq!(shared.state(), ManagerState::Locked);
}
