//! A PinWeaver backend implemented in software.
//!
//! Used in tests and on hosts without a secure element. It enforces the same
//! rules a hardware backend would (MAC and root verification, delay
//! schedules, expiration, policies, a bounded replay log) but its keys live
//! in process memory and, optionally, in `backend/state.cbor`.

mod clock;
mod crypto;
mod metadata;
mod state;

use std::sync::Arc;

use subtle::ConstantTimeEq;
use tracing::{debug, info};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::backend::{
    BackendError, BackendResult, BiometricsAuthReply, CheckLeafReply, InsertLeafRequest,
    LeafProof, LeafUpdate, PinWeaverBackend, ReplayedLeaf, ResetLeafReply,
};
use crate::hash_tree::{empty_root, root_from_aux, Label, TreeGeometry};
use crate::storage::{AtomicBlobStore, FsBlobStore, StoragePaths, BACKEND_STATE_BLOB};
use crate::types::{
    effective_expiration, AuthChannel, AuthOutcome, CheckCredentialReply, DelaySchedule, Hash,
    LeafInfo, LogEntry, LogEntryKind, ResetType, StartBiometricsAuthReply, ValidPcrValue,
    EMPTY_HASH,
};

pub use clock::{Clock, ManualClock, SystemClock};
pub use crypto::{decrypt_he_secret, derive_pairing_key, derive_session_key, NONCE_SIZE};

use crypto::{encrypt_he_secret, random_bytes};
use metadata::{LeafMetadata, PublicMetadata, SealedSecrets, METADATA_VERSION};
use state::{BackendState, ProvisionedTree};

/// Default number of entries kept in the replay log.
pub const DEFAULT_LOG_CAPACITY: usize = 2;

/// Largest delay schedule a leaf may carry.
pub const MAX_DELAY_SCHEDULE_ENTRIES: usize = 16;

/// Software implementation of [`PinWeaverBackend`].
///
/// Every mutation is applied to a copy of the state, persisted, and only
/// then made current, so a failed write leaves the backend unchanged.
pub struct SoftwareBackend {
    state: BackendState,
    store: Option<Arc<dyn AtomicBlobStore>>,
    clock: Arc<dyn Clock>,
    log_capacity: usize,
    available: bool,
    platform_state: Option<ValidPcrValue>,
}

impl std::fmt::Debug for SoftwareBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareBackend")
            .field("tree", &self.state.tree)
            .field("log_len", &self.state.log.len())
            .field("persistent", &self.store.is_some())
            .field("available", &self.available)
            .finish_non_exhaustive()
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareBackend {
    /// Fresh, unprovisioned, memory-only backend using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: BackendState::generate(),
            store: None,
            clock: Arc::new(SystemClock),
            log_capacity: DEFAULT_LOG_CAPACITY,
            available: true,
            platform_state: None,
        }
    }

    /// Backend persisted in `store`, loading existing state if present.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Hardware`] if the state cannot be read,
    /// decoded or initially written.
    pub fn open(store: Arc<dyn AtomicBlobStore>) -> BackendResult<Self> {
        let existing = store
            .read(BACKEND_STATE_BLOB)
            .map_err(|e| BackendError::Hardware {
                reason: e.to_string(),
            })?;

        let mut backend = Self::new();
        if let Some(bytes) = existing {
            backend.state = BackendState::from_cbor(&bytes)?;
            debug!("software backend state loaded");
        } else {
            write_state(store.as_ref(), &backend.state)?;
            info!("software backend state created");
        }
        backend.store = Some(store);
        Ok(backend)
    }

    /// Backend persisted under `<root>/backend/`.
    ///
    /// # Errors
    ///
    /// See [`SoftwareBackend::open`].
    pub fn open_dir(paths: &StoragePaths) -> BackendResult<Self> {
        let store = FsBlobStore::new(paths.backend_dir()).map_err(|e| BackendError::Hardware {
            reason: e.to_string(),
        })?;
        Self::open(Arc::new(store))
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Sets how many log entries are kept (at least one).
    #[must_use]
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity.max(1);
        self
    }

    /// Simulates the backend going away: every call fails with
    /// [`BackendError::Hardware`] while `false`.
    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    /// Sets the platform state that leaf policies are matched against.
    pub fn set_platform_state(&mut self, platform_state: Option<ValidPcrValue>) {
        self.platform_state = platform_state;
    }

    /// Current log, oldest first.
    #[must_use]
    pub fn log(&self) -> Vec<LogEntry> {
        self.state.log.iter().cloned().collect()
    }

    fn ensure_available(&self) -> BackendResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(BackendError::Hardware {
                reason: "backend unavailable".to_string(),
            })
        }
    }

    fn commit(&mut self, next: BackendState) -> BackendResult<()> {
        if let Some(store) = &self.store {
            write_state(store.as_ref(), &next)?;
        }
        self.state = next;
        Ok(())
    }

    /// Verifies the leaf MAC, then that the leaf and aux hashes reproduce the
    /// backend root. Returns the decoded metadata.
    fn verify_leaf(&self, proof: &LeafProof) -> BackendResult<(ProvisionedTree, LeafMetadata)> {
        let tree = self.state.tree()?;
        self.state
            .keys
            .verify_leaf_mac(proof.label, &proof.metadata, &proof.mac)?;
        let metadata = LeafMetadata::decode(&proof.metadata)?;
        if metadata.public.label != proof.label.0 {
            return Err(BackendError::InvalidLeaf {
                reason: format!(
                    "metadata belongs to label {}, presented as {}",
                    metadata.public.label, proof.label
                ),
            });
        }
        check_root(tree, proof.label, &proof.mac, &proof.aux)?;
        Ok((tree, metadata))
    }

    fn check_policy(&self, public: &PublicMetadata) -> BackendResult<()> {
        if public.policies.is_empty()
            || self
                .platform_state
                .as_ref()
                .is_some_and(|current| public.policies.contains(current))
        {
            Ok(())
        } else {
            Err(BackendError::PolicyNotMatch)
        }
    }

    /// Policy, expiration and delay checks that precede any attempt.
    fn gate(&self, public: &PublicMetadata, now: u64) -> BackendResult<()> {
        self.check_policy(public)?;
        if public.is_expired(now) {
            return Err(BackendError::Expired);
        }
        let delay_seconds = public.remaining_delay(now);
        if delay_seconds > 0 {
            return Err(BackendError::LockedOut { delay_seconds });
        }
        Ok(())
    }

    /// Re-encodes and MACs `metadata`, returning the update and the new root.
    fn finish_update(
        &self,
        tree: ProvisionedTree,
        label: Label,
        aux: &[Hash],
        metadata: &LeafMetadata,
    ) -> BackendResult<LeafUpdate> {
        let bytes = metadata.encode()?;
        let mac = self.state.keys.leaf_mac(label, &bytes)?;
        let root = root_from_aux(tree.geometry, label, &mac, aux).ok_or_else(|| aux_error(tree))?;
        Ok(LeafUpdate {
            metadata: bytes,
            mac,
            root,
        })
    }

    /// Publishes `update` as the new root and logs `kind`.
    fn apply(&mut self, label: Label, update: &LeafUpdate, kind: LogEntryKind) -> BackendResult<()> {
        let mut next = self.state.clone();
        if let Some(tree) = next.tree.as_mut() {
            tree.root = update.root;
        }
        next.push_log(
            LogEntry {
                root: update.root,
                label,
                kind,
            },
            self.log_capacity,
        );
        self.commit(next)
    }

    fn open_secrets(&self, label: Label, metadata: &LeafMetadata) -> BackendResult<SealedSecrets> {
        let plaintext = Zeroizing::new(
            self.state
                .keys
                .unseal(label, &metadata.nonce, &metadata.sealed)?,
        );
        SealedSecrets::from_cbor(&plaintext)
    }

    fn decode_public(&self, metadata: &[u8]) -> BackendResult<PublicMetadata> {
        self.ensure_available()?;
        Ok(LeafMetadata::decode(metadata)?.public)
    }
}

impl PinWeaverBackend for SoftwareBackend {
    fn reset_tree(&mut self, geometry: TreeGeometry) -> BackendResult<Hash> {
        self.ensure_available()?;
        geometry
            .validate()
            .map_err(|reason| BackendError::InvalidArgument { reason })?;

        let root = empty_root(geometry);
        let mut next = self.state.clone();
        next.tree = Some(ProvisionedTree { geometry, root });
        next.log.clear();
        next.push_log(
            LogEntry {
                root,
                label: Label(0),
                kind: LogEntryKind::ResetTree,
            },
            self.log_capacity,
        );
        self.commit(next)?;
        info!(%geometry, "backend tree reset");
        Ok(root)
    }

    fn get_root_hash(&mut self) -> BackendResult<Hash> {
        self.ensure_available()?;
        Ok(self.state.tree()?.root)
    }

    fn insert_leaf(&mut self, request: InsertLeafRequest) -> BackendResult<LeafUpdate> {
        self.ensure_available()?;
        let tree = self.state.tree()?;
        validate_schedule(&request.delay_schedule)?;

        let he = match (&request.auth_channel, &request.he_secret) {
            (Some(channel), _) => {
                if !self.state.pairings.contains_key(channel) {
                    return Err(BackendError::ChannelNotPaired { channel: *channel });
                }
                random_bytes::<32>().to_vec()
            }
            (None, Some(he_secret)) => he_secret.to_vec(),
            (None, None) => {
                return Err(BackendError::InvalidArgument {
                    reason: "credential needs a high-entropy secret".to_string(),
                })
            }
        };
        let le = match (&request.auth_channel, &request.le_secret) {
            (None, None) => {
                return Err(BackendError::InvalidArgument {
                    reason: "credential needs a low-entropy secret".to_string(),
                })
            }
            (_, le_secret) => le_secret.as_ref().map(|s| s.to_vec()).unwrap_or_default(),
        };

        check_root(tree, request.label, &EMPTY_HASH, &request.aux)?;

        let now = self.clock.now();
        let expiration_delay = effective_expiration(request.expiration_delay);
        let secrets = SealedSecrets {
            le,
            he,
            reset: request.reset_secret.to_vec(),
        };
        let (nonce, sealed) = self.state.keys.seal(request.label, &secrets.to_cbor()?)?;
        let metadata = LeafMetadata {
            public: PublicMetadata {
                version: METADATA_VERSION,
                label: request.label.0,
                wrong_attempts: 0,
                delay_schedule: request.delay_schedule,
                policies: request.policies,
                expiration_delay,
                expiration_timestamp: expiration_delay.map(|delay| now + u64::from(delay)),
                last_access: now,
                auth_channel: request.auth_channel,
            },
            nonce,
            sealed,
        };

        let update = self.finish_update(tree, request.label, &request.aux, &metadata)?;
        self.apply(request.label, &update, LogEntryKind::Insert { mac: update.mac })?;
        debug!(label = %request.label, "leaf inserted");
        Ok(update)
    }

    fn check_leaf(&mut self, proof: &LeafProof, le_secret: &[u8]) -> BackendResult<CheckLeafReply> {
        self.ensure_available()?;
        let (tree, mut metadata) = self.verify_leaf(proof)?;
        if metadata.public.auth_channel.is_some() {
            return Err(BackendError::InvalidArgument {
                reason: "rate limiters are authenticated through biometrics".to_string(),
            });
        }
        let now = self.clock.now();
        self.gate(&metadata.public, now)?;

        let secrets = self.open_secrets(proof.label, &metadata)?;
        let matched = bool::from(secrets.le.as_slice().ct_eq(le_secret));

        let outcome = if matched {
            metadata.public.wrong_attempts = 0;
            AuthOutcome::Success
        } else {
            metadata.public.wrong_attempts = metadata.public.wrong_attempts.saturating_add(1);
            AuthOutcome::Failure
        };
        metadata.public.last_access = now;

        let update = self.finish_update(tree, proof.label, &proof.aux, &metadata)?;
        self.apply(
            proof.label,
            &update,
            LogEntryKind::Auth {
                outcome,
                timestamp: now,
                mac: update.mac,
            },
        )?;
        debug!(label = %proof.label, %outcome, attempts = metadata.public.wrong_attempts, "leaf checked");

        let secrets = matched.then(|| CheckCredentialReply {
            he_secret: Zeroizing::new(secrets.he.clone()),
            reset_secret: Zeroizing::new(secrets.reset.clone()),
        });
        Ok(CheckLeafReply { update, secrets })
    }

    fn reset_leaf(
        &mut self,
        proof: &LeafProof,
        reset_secret: &[u8],
        reset_type: ResetType,
    ) -> BackendResult<ResetLeafReply> {
        self.ensure_available()?;
        let (tree, mut metadata) = self.verify_leaf(proof)?;
        self.check_policy(&metadata.public)?;

        let secrets = self.open_secrets(proof.label, &metadata)?;
        if !bool::from(secrets.reset.as_slice().ct_eq(reset_secret)) {
            debug!(label = %proof.label, "reset secret rejected");
            return Ok(ResetLeafReply::WrongSecret);
        }

        let now = self.clock.now();
        let extend_expiration = reset_type.extends_expiration();
        metadata.public.wrong_attempts = 0;
        if extend_expiration {
            metadata.public.expiration_timestamp = metadata
                .public
                .expiration_delay
                .map(|delay| now + u64::from(delay));
        }

        let update = self.finish_update(tree, proof.label, &proof.aux, &metadata)?;
        self.apply(
            proof.label,
            &update,
            LogEntryKind::Reset {
                extend_expiration,
                timestamp: now,
                mac: update.mac,
            },
        )?;
        debug!(label = %proof.label, %reset_type, "leaf reset");
        Ok(ResetLeafReply::Reset(update))
    }

    fn remove_leaf(&mut self, label: Label, aux: &[Hash], mac: &Hash) -> BackendResult<Hash> {
        self.ensure_available()?;
        let tree = self.state.tree()?;
        check_root(tree, label, mac, aux)?;

        let root = root_from_aux(tree.geometry, label, &EMPTY_HASH, aux)
            .ok_or_else(|| aux_error(tree))?;
        let update = LeafUpdate {
            metadata: Vec::new(),
            mac: EMPTY_HASH,
            root,
        };
        self.apply(label, &update, LogEntryKind::Remove)?;
        debug!(%label, "leaf removed");
        Ok(root)
    }

    fn generate_pk(
        &mut self,
        channel: AuthChannel,
        client_public_key: &[u8; 32],
    ) -> BackendResult<[u8; 32]> {
        self.ensure_available()?;
        let secret = StaticSecret::from(random_bytes::<32>());
        let public = PublicKey::from(&secret);
        let shared = secret.diffie_hellman(&PublicKey::from(*client_public_key));
        let pairing_key = derive_pairing_key(shared.as_bytes())?;

        let mut next = self.state.clone();
        next.pairings.insert(channel, crypto::PairingKey(pairing_key));
        self.commit(next)?;
        info!(%channel, "auth channel paired");
        Ok(*public.as_bytes())
    }

    fn start_biometrics_auth(
        &mut self,
        proof: &LeafProof,
        channel: AuthChannel,
        client_nonce: &[u8; 32],
    ) -> BackendResult<BiometricsAuthReply> {
        self.ensure_available()?;
        let pairing_key = self
            .state
            .pairings
            .get(&channel)
            .map(|key| key.0)
            .ok_or(BackendError::ChannelNotPaired { channel })?;

        let (tree, mut metadata) = self.verify_leaf(proof)?;
        if metadata.public.auth_channel != Some(channel) {
            return Err(BackendError::InvalidArgument {
                reason: format!("label {} is not a {channel} rate limiter", proof.label),
            });
        }
        let now = self.clock.now();
        self.gate(&metadata.public, now)?;

        let secrets = self.open_secrets(proof.label, &metadata)?;
        let server_nonce = random_bytes::<32>();
        let iv = random_bytes::<NONCE_SIZE>();
        let session_key = derive_session_key(&pairing_key, client_nonce, &server_nonce)?;
        let encrypted_he_secret = encrypt_he_secret(&session_key, &iv, &secrets.he)?;

        // The attempt counts as failed until the verifier resets the limiter.
        metadata.public.wrong_attempts = metadata.public.wrong_attempts.saturating_add(1);
        metadata.public.last_access = now;

        let update = self.finish_update(tree, proof.label, &proof.aux, &metadata)?;
        self.apply(
            proof.label,
            &update,
            LogEntryKind::Auth {
                outcome: AuthOutcome::Failure,
                timestamp: now,
                mac: update.mac,
            },
        )?;
        debug!(label = %proof.label, %channel, "biometrics auth started");

        Ok(BiometricsAuthReply {
            update,
            reply: StartBiometricsAuthReply {
                server_nonce,
                iv,
                encrypted_he_secret,
            },
        })
    }

    fn get_log(&mut self, root: &Hash) -> BackendResult<Vec<LogEntry>> {
        self.ensure_available()?;
        let start = self
            .state
            .log
            .iter()
            .rposition(|entry| &entry.root == root)
            .map_or(0, |position| position + 1);
        Ok(self.state.log.iter().skip(start).cloned().collect())
    }

    fn replay_log_operation(
        &mut self,
        label: Label,
        log_root: &Hash,
        aux: &[Hash],
        metadata: &[u8],
    ) -> BackendResult<ReplayedLeaf> {
        self.ensure_available()?;
        let tree = self.state.tree()?;
        let entry = self
            .state
            .log
            .iter()
            .find(|entry| &entry.root == log_root && entry.label == label)
            .cloned()
            .ok_or_else(|| BackendError::InvalidArgument {
                reason: format!("no log entry for label {label} with the given root"),
            })?;

        let mut decoded = LeafMetadata::decode(metadata)?;
        match entry.kind {
            LogEntryKind::Auth {
                outcome,
                timestamp,
                ..
            } => {
                decoded.public.wrong_attempts = match outcome {
                    AuthOutcome::Success => 0,
                    AuthOutcome::Failure => decoded.public.wrong_attempts.saturating_add(1),
                };
                decoded.public.last_access = timestamp;
            }
            LogEntryKind::Reset {
                extend_expiration,
                timestamp,
                ..
            } => {
                decoded.public.wrong_attempts = 0;
                if extend_expiration {
                    decoded.public.expiration_timestamp = decoded
                        .public
                        .expiration_delay
                        .map(|delay| timestamp + u64::from(delay));
                }
            }
            LogEntryKind::Insert { .. } | LogEntryKind::Remove | LogEntryKind::ResetTree => {
                return Err(BackendError::InvalidArgument {
                    reason: "only auth and reset entries can be replayed".to_string(),
                });
            }
        }

        let update = self.finish_update(tree, label, aux, &decoded)?;
        if &update.root != log_root {
            return Err(BackendError::OutOfSync);
        }
        Ok(ReplayedLeaf {
            metadata: update.metadata,
            mac: update.mac,
        })
    }

    fn leaf_info(&self, metadata: &[u8]) -> BackendResult<LeafInfo> {
        Ok(self.decode_public(metadata)?.info())
    }

    fn delay_in_seconds(&self, metadata: &[u8]) -> BackendResult<u32> {
        Ok(self.decode_public(metadata)?.remaining_delay(self.clock.now()))
    }

    fn expiration_in_seconds(&self, metadata: &[u8]) -> BackendResult<Option<u32>> {
        Ok(self
            .decode_public(metadata)?
            .remaining_expiration(self.clock.now()))
    }
}

fn write_state(store: &dyn AtomicBlobStore, state: &BackendState) -> BackendResult<()> {
    store
        .write_atomic(BACKEND_STATE_BLOB, &state.to_cbor()?)
        .map_err(|e| BackendError::Hardware {
            reason: e.to_string(),
        })
}

fn check_root(tree: ProvisionedTree, label: Label, leaf_hash: &Hash, aux: &[Hash]) -> BackendResult<()> {
    let root = root_from_aux(tree.geometry, label, leaf_hash, aux).ok_or_else(|| aux_error(tree))?;
    if root == tree.root {
        Ok(())
    } else {
        Err(BackendError::OutOfSync)
    }
}

fn aux_error(tree: ProvisionedTree) -> BackendError {
    BackendError::InvalidArgument {
        reason: format!(
            "label outside the tree or aux hash count is not {}",
            tree.geometry.aux_len()
        ),
    }
}

fn validate_schedule(schedule: &DelaySchedule) -> BackendResult<()> {
    if schedule.len() > MAX_DELAY_SCHEDULE_ENTRIES {
        return Err(BackendError::InvalidArgument {
            reason: format!(
                "delay schedule has {} entries, at most {MAX_DELAY_SCHEDULE_ENTRIES} allowed",
                schedule.len()
            ),
        });
    }
    if schedule.iter().any(|(attempts, _)| attempts == 0) {
        return Err(BackendError::InvalidArgument {
            reason: "delay schedule thresholds start at 1".to_string(),
        });
    }
    Ok(())
}
