//! The PinWeaver manager: every public credential operation.
//!
//! Each operation reads the leaf and its aux hashes from the local
//! [`HashTree`], hands them to the backend, and persists whatever the backend
//! returns. The backend has already committed by the time the local write
//! happens, so a write that keeps failing after retries leaves the two roots
//! apart with no way to tell which leaf is right: the manager then moves to
//! [`ManagerState::Locked`] and refuses everything until it is rebuilt.
//!
//! A backend answering `OutOfSync` means the local tree is behind. The
//! manager replays the backend log (see `replay.rs`) and retries the
//! operation once.

mod replay;
mod shared;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use backon::{BlockingRetryable, ConstantBuilder};
use strum::Display;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::backend::{BackendError, InsertLeafRequest, LeafProof, PinWeaverBackend, ResetLeafReply};
use crate::config::PinWeaverConfig;
use crate::error::{PinWeaverError, PinWeaverResult};
use crate::hash_tree::{HashTree, Label, TreeError};
use crate::storage::{AtomicBlobStore, LeafFileStore, StorageLockGuard, TreeStorage};
use crate::types::{
    AuthChannel, CheckCredentialReply, DelaySchedule, Hash, ResetType, StartBiometricsAuthReply,
    ValidPcrValue, EMPTY_HASH,
};

pub use shared::SharedPinWeaverManager;

/// Lifecycle of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ManagerState {
    /// Constructed; `init` has not succeeded yet.
    Uninitialized,
    /// Serving operations.
    Ready,
    /// A local write failed after the backend committed. Terminal.
    Locked,
}

/// What `update_hash_tree` is persisting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum UpdateType {
    /// A leaf the backend just created.
    InsertLeaf,
    /// New metadata for an existing leaf.
    UpdateLeaf,
    /// A leaf the backend just removed.
    RemoveLeaf,
    /// A leaf recomputed from the backend log during replay.
    ReplayInsertLeaf,
}

enum State {
    Uninitialized {
        leaf_store: Arc<dyn LeafFileStore>,
        cache_store: Arc<dyn AtomicBlobStore>,
    },
    Ready(HashTree),
    Locked,
}

/// Orchestrates credential operations between the local tree and a backend.
pub struct PinWeaverManager<B: PinWeaverBackend> {
    backend: B,
    config: PinWeaverConfig,
    state: State,
    _lock: Option<StorageLockGuard>,
}

impl<B: PinWeaverBackend> std::fmt::Debug for PinWeaverManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinWeaverManager")
            .field("state", &self.state())
            .field("geometry", &self.config.geometry())
            .finish_non_exhaustive()
    }
}

impl<B: PinWeaverBackend> PinWeaverManager<B> {
    /// Creates an uninitialized manager over `storage`.
    ///
    /// # Errors
    ///
    /// Returns [`PinWeaverError::Config`] if `config` is out of range.
    pub fn new(backend: B, storage: TreeStorage, config: PinWeaverConfig) -> PinWeaverResult<Self> {
        config.validate()?;
        let TreeStorage {
            leaf_store,
            cache_store,
            lock,
        } = storage;
        Ok(Self {
            backend,
            config,
            state: State::Uninitialized {
                leaf_store,
                cache_store,
            },
            _lock: lock,
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ManagerState {
        match self.state {
            State::Uninitialized { .. } => ManagerState::Uninitialized,
            State::Ready(_) => ManagerState::Ready,
            State::Locked => ManagerState::Locked,
        }
    }

    /// The configuration the manager was built with.
    #[must_use]
    pub const fn config(&self) -> &PinWeaverConfig {
        &self.config
    }

    /// The backend.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable access to the backend, for hosts that drive it directly.
    pub const fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Consumes the manager, releasing the tree directory lock.
    #[must_use]
    pub fn into_backend(self) -> B {
        self.backend
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Opens the local tree and brings it in line with the backend.
    ///
    /// An empty local tree facing a never-provisioned backend provisions it
    /// with the configured geometry. Placeholders left by an insert that
    /// never finished are dropped. A root mismatch runs replay; the manager
    /// is ready afterwards even if replay could not restore agreement, and
    /// later operations retry it.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be opened, the backend is
    /// unreachable, or the backend was never provisioned while the local tree
    /// holds leaves. The manager stays uninitialized in that case.
    pub fn init(&mut self) -> PinWeaverResult<()> {
        let (leaf_store, cache_store) = match &self.state {
            State::Uninitialized {
                leaf_store,
                cache_store,
            } => (Arc::clone(leaf_store), Arc::clone(cache_store)),
            State::Ready(_) => {
                debug!("manager already initialized");
                return Ok(());
            }
            State::Locked => return Err(PinWeaverError::Locked),
        };

        let mut tree = HashTree::open(leaf_store, cache_store, self.config.geometry())?;
        for label in tree.tentative_labels() {
            warn!(%label, "dropping placeholder of an unfinished insert");
            tree.remove_leaf(label)?;
        }

        match self.backend.get_root_hash() {
            Ok(root) if root == tree.root_hash() => {
                self.state = State::Ready(tree);
            }
            Ok(_) => {
                self.state = State::Ready(tree);
                if let Err(err) = self.replay_log() {
                    warn!(error = %err, "hash tree still out of sync after init");
                }
            }
            Err(BackendError::NotProvisioned) if tree.is_empty() => {
                self.backend.reset_tree(self.config.geometry())?;
                info!(geometry = %self.config.geometry(), "backend tree provisioned");
                self.state = State::Ready(tree);
            }
            Err(BackendError::NotProvisioned) => {
                return Err(PinWeaverError::failed_precondition(format!(
                    "backend was never provisioned but the local tree holds {} leaves",
                    tree.len()
                )));
            }
            Err(err) => return Err(err.into()),
        }

        info!(leaves = self.tree()?.len(), "manager ready");
        Ok(())
    }

    /// Wipes every local leaf and asks the backend for a fresh empty tree.
    ///
    /// Works from `Uninitialized` too, which is how a tree that cannot be
    /// synchronized any more is recovered.
    ///
    /// # Errors
    ///
    /// Returns [`PinWeaverError::Locked`] in the locked state, or an error
    /// if the backend refuses. A local wipe that fails after the backend
    /// reset locks the manager.
    pub fn reset_tree(&mut self) -> PinWeaverResult<()> {
        if let State::Uninitialized {
            leaf_store,
            cache_store,
        } = &self.state
        {
            let tree = HashTree::open(
                Arc::clone(leaf_store),
                Arc::clone(cache_store),
                self.config.geometry(),
            )?;
            self.state = State::Ready(tree);
        }
        self.tree()?;

        self.backend.reset_tree(self.config.geometry())?;
        let policy = self.retry_policy();
        let tree = self.tree_mut()?;
        let result = (|| tree.clear())
            .retry(policy)
            .sleep(std::thread::sleep)
            .call();
        if let Err(err) = result {
            return Err(self.lock(&format!("clearing local tree failed: {err}")));
        }
        info!("credential tree reset");
        Ok(())
    }

    /// Compares roots and replays the backend log if they differ. Also
    /// recomputes the local tree from its leaves to catch silent damage.
    ///
    /// # Errors
    ///
    /// Returns [`PinWeaverError::Corruption`] if the local tree is
    /// inconsistent, or [`PinWeaverError::FailedPrecondition`] if replay
    /// could not restore agreement.
    pub fn sync_hash_tree(&mut self) -> PinWeaverResult<()> {
        self.tree()?.verify()?;
        self.replay_log()
    }

    // =========================================================================
    // Credentials
    // =========================================================================

    /// Inserts a credential in the lowest free slot and returns its label.
    ///
    /// # Errors
    ///
    /// Returns [`PinWeaverError::ResourceExhausted`] when every slot is
    /// used, [`PinWeaverError::InvalidArgument`] for a bad schedule, or
    /// [`PinWeaverError::Corruption`] if the result could not be persisted.
    pub fn insert_credential(
        &mut self,
        policies: &[ValidPcrValue],
        le_secret: &[u8],
        he_secret: &[u8],
        reset_secret: &[u8],
        delay_schedule: &DelaySchedule,
        expiration_delay: Option<u32>,
    ) -> PinWeaverResult<Label> {
        let label = self.insert_leaf(&|label, aux| InsertLeafRequest {
            label,
            aux,
            le_secret: Some(Zeroizing::new(le_secret.to_vec())),
            he_secret: Some(Zeroizing::new(he_secret.to_vec())),
            reset_secret: Zeroizing::new(reset_secret.to_vec()),
            delay_schedule: delay_schedule.clone(),
            policies: policies.to_vec(),
            expiration_delay,
            auth_channel: None,
        })?;
        info!(%label, "credential inserted");
        Ok(label)
    }

    /// Checks `le_secret` and returns the credential's secrets.
    ///
    /// A wrong secret is charged and persisted before
    /// [`PinWeaverError::WrongSecret`] is returned.
    ///
    /// # Errors
    ///
    /// Returns [`PinWeaverError::WrongSecret`], [`PinWeaverError::LockedOut`],
    /// [`PinWeaverError::Expired`], [`PinWeaverError::PolicyNotMatch`] or
    /// [`PinWeaverError::NotFound`].
    pub fn check_credential(
        &mut self,
        label: Label,
        le_secret: &[u8],
    ) -> PinWeaverResult<CheckCredentialReply> {
        self.with_sync_retry(|this| {
            let proof = this.leaf_proof(label)?;
            let reply = this.backend.check_leaf(&proof, le_secret)?;
            this.update_hash_tree(
                label,
                &reply.update.metadata,
                reply.update.mac,
                UpdateType::UpdateLeaf,
            )?;
            debug!(%label, outcome = %reply.outcome(), "credential checked");
            reply.secrets.ok_or(PinWeaverError::WrongSecret)
        })
    }

    /// Clears the wrong-attempt counter of `label` (and with
    /// [`ResetType::WrongAttemptsAndExpiration`] restarts its expiration
    /// window).
    ///
    /// # Errors
    ///
    /// Returns [`PinWeaverError::WrongSecret`] if `reset_secret` does not
    /// match; nothing changes in that case.
    pub fn reset_credential(
        &mut self,
        label: Label,
        reset_secret: &[u8],
        reset_type: ResetType,
    ) -> PinWeaverResult<()> {
        self.with_sync_retry(|this| {
            let proof = this.leaf_proof(label)?;
            match this.backend.reset_leaf(&proof, reset_secret, reset_type)? {
                ResetLeafReply::Reset(update) => {
                    this.update_hash_tree(label, &update.metadata, update.mac, UpdateType::UpdateLeaf)?;
                    info!(%label, %reset_type, "credential reset");
                    Ok(())
                }
                ResetLeafReply::WrongSecret => Err(PinWeaverError::WrongSecret),
            }
        })
    }

    /// Removes `label` from the backend and the local tree.
    ///
    /// Leaves whose metadata was lost can still be removed.
    ///
    /// # Errors
    ///
    /// Returns [`PinWeaverError::NotFound`] for an empty slot.
    pub fn remove_credential(&mut self, label: Label) -> PinWeaverResult<()> {
        self.with_sync_retry(|this| {
            let tree = this.tree()?;
            let leaf = tree.get_leaf(label)?;
            let aux = tree.get_aux_hashes(label)?;
            this.backend.remove_leaf(label, &aux, &leaf.mac)?;
            this.update_hash_tree(label, &[], EMPTY_HASH, UpdateType::RemoveLeaf)?;
            info!(%label, "credential removed");
            Ok(())
        })
    }

    // =========================================================================
    // Inspectors
    // =========================================================================

    /// Wrong attempts since the last success or reset.
    ///
    /// # Errors
    ///
    /// Returns [`PinWeaverError::NotFound`] for an empty slot.
    pub fn get_wrong_auth_attempts(&self, label: Label) -> PinWeaverResult<u32> {
        let metadata = self.usable_metadata(label)?;
        Ok(self.backend.leaf_info(&metadata)?.wrong_attempts)
    }

    /// The schedule fixed at insert.
    ///
    /// # Errors
    ///
    /// Returns [`PinWeaverError::NotFound`] for an empty slot.
    pub fn get_delay_schedule(&self, label: Label) -> PinWeaverResult<DelaySchedule> {
        let metadata = self.usable_metadata(label)?;
        Ok(self.backend.leaf_info(&metadata)?.delay_schedule)
    }

    /// Seconds until `label` accepts another attempt; `u32::MAX` when locked
    /// out until a reset.
    ///
    /// # Errors
    ///
    /// Returns [`PinWeaverError::NotFound`] for an empty slot.
    pub fn get_delay_in_seconds(&self, label: Label) -> PinWeaverResult<u32> {
        let metadata = self.usable_metadata(label)?;
        Ok(self.backend.delay_in_seconds(&metadata)?)
    }

    /// Seconds until `label` expires, `None` if it never does.
    ///
    /// # Errors
    ///
    /// Returns [`PinWeaverError::NotFound`] for an empty slot.
    pub fn get_expiration_in_seconds(&self, label: Label) -> PinWeaverResult<Option<u32>> {
        let metadata = self.usable_metadata(label)?;
        Ok(self.backend.expiration_in_seconds(&metadata)?)
    }

    /// Every stored label, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error outside the ready state.
    pub fn list_labels(&self) -> PinWeaverResult<Vec<Label>> {
        Ok(self.tree()?.labels())
    }

    /// The local root hash.
    ///
    /// # Errors
    ///
    /// Returns an error outside the ready state.
    pub fn root_hash(&self) -> PinWeaverResult<Hash> {
        Ok(self.tree()?.root_hash())
    }

    // =========================================================================
    // Rate limiters
    // =========================================================================

    /// Pairs `auth_channel` with the caller's X25519 key and returns the
    /// backend's public key.
    ///
    /// # Errors
    ///
    /// Returns an error outside the ready state or if the backend fails.
    pub fn generate_pk(
        &mut self,
        auth_channel: AuthChannel,
        client_public_key: &[u8; 32],
    ) -> PinWeaverResult<[u8; 32]> {
        self.tree()?;
        let server_public_key = self.backend.generate_pk(auth_channel, client_public_key)?;
        info!(%auth_channel, "auth channel paired");
        Ok(server_public_key)
    }

    /// Inserts a rate limiter bound to `auth_channel`.
    ///
    /// # Errors
    ///
    /// Returns [`PinWeaverError::FailedPrecondition`] if the channel was
    /// never paired, otherwise as for [`Self::insert_credential`].
    pub fn insert_rate_limiter(
        &mut self,
        auth_channel: AuthChannel,
        policies: &[ValidPcrValue],
        reset_secret: &[u8],
        delay_schedule: &DelaySchedule,
        expiration_delay: Option<u32>,
    ) -> PinWeaverResult<Label> {
        let label = self.insert_leaf(&|label, aux| InsertLeafRequest {
            label,
            aux,
            le_secret: None,
            he_secret: None,
            reset_secret: Zeroizing::new(reset_secret.to_vec()),
            delay_schedule: delay_schedule.clone(),
            policies: policies.to_vec(),
            expiration_delay,
            auth_channel: Some(auth_channel),
        })?;
        info!(%label, %auth_channel, "rate limiter inserted");
        Ok(label)
    }

    /// Charges one attempt on a rate limiter and returns its HE secret
    /// encrypted for the paired channel. A successful match is reported by
    /// resetting the rate limiter.
    ///
    /// # Errors
    ///
    /// Returns [`PinWeaverError::LockedOut`] or [`PinWeaverError::Expired`]
    /// as for credentials, [`PinWeaverError::FailedPrecondition`] if the
    /// channel is not paired.
    pub fn start_biometrics_auth(
        &mut self,
        auth_channel: AuthChannel,
        label: Label,
        client_nonce: &[u8; 32],
    ) -> PinWeaverResult<StartBiometricsAuthReply> {
        self.with_sync_retry(|this| {
            let proof = this.leaf_proof(label)?;
            let reply = this
                .backend
                .start_biometrics_auth(&proof, auth_channel, client_nonce)?;
            this.update_hash_tree(
                label,
                &reply.update.metadata,
                reply.update.mac,
                UpdateType::UpdateLeaf,
            )?;
            debug!(%label, %auth_channel, "biometrics auth started");
            Ok(reply.reply)
        })
    }

    // =========================================================================
    // Shared plumbing
    // =========================================================================

    /// Picks the lowest free label, writes a placeholder so a crash mid-way
    /// is visible on the next `init`, and asks the backend for the leaf.
    fn insert_leaf(
        &mut self,
        build: &dyn Fn(Label, Vec<Hash>) -> InsertLeafRequest,
    ) -> PinWeaverResult<Label> {
        self.with_sync_retry(|this| {
            let tree = this.tree_mut()?;
            let label = tree
                .first_free_label()
                .ok_or(PinWeaverError::ResourceExhausted)?;
            let aux = tree.get_aux_hashes(label)?;
            tree.store_leaf(label, &[], EMPTY_HASH, true)?;

            match this.backend.insert_leaf(build(label, aux)) {
                Ok(update) => {
                    this.update_hash_tree(
                        label,
                        &update.metadata,
                        update.mac,
                        UpdateType::InsertLeaf,
                    )?;
                    Ok(label)
                }
                Err(err) => {
                    let cleanup = this
                        .tree_mut()
                        .and_then(|tree| tree.remove_leaf(label).map_err(Into::into));
                    if let Err(cleanup) = cleanup {
                        warn!(%label, error = %cleanup, "placeholder left behind");
                    }
                    Err(err.into())
                }
            }
        })
    }

    /// Persists a backend result, retrying with a constant backoff.
    ///
    /// For [`UpdateType::ReplayInsertLeaf`] a failure is tolerated: the leaf
    /// is marked `metadata_lost` on a best-effort basis and replay goes on.
    /// For every other kind the manager locks.
    pub(super) fn update_hash_tree(
        &mut self,
        label: Label,
        metadata: &[u8],
        mac: Hash,
        update_type: UpdateType,
    ) -> PinWeaverResult<()> {
        let Err(err) = self.persist(label, metadata, mac, update_type) else {
            return Ok(());
        };

        if update_type == UpdateType::ReplayInsertLeaf {
            warn!(%label, error = %err, "could not persist replayed leaf, marking metadata lost");
            if let Ok(tree) = self.tree_mut() {
                if let Err(err) = tree.store_leaf(label, metadata, mac, true) {
                    warn!(%label, error = %err, "could not mark leaf metadata lost");
                }
            }
            return Ok(());
        }
        Err(self.lock(&format!("{update_type} of label {label} not persisted: {err}")))
    }

    fn persist(
        &mut self,
        label: Label,
        metadata: &[u8],
        mac: Hash,
        update_type: UpdateType,
    ) -> PinWeaverResult<()> {
        let policy = self.retry_policy();
        let tree = self.tree_mut()?;
        let result = (|| match update_type {
            UpdateType::RemoveLeaf => tree.remove_leaf(label),
            UpdateType::InsertLeaf | UpdateType::UpdateLeaf | UpdateType::ReplayInsertLeaf => {
                tree.store_leaf(label, metadata, mac, false)
            }
        })
        .retry(policy)
        .sleep(std::thread::sleep)
        .when(|err: &TreeError| matches!(err, TreeError::Storage(_)))
        .notify(|err: &TreeError, after: Duration| {
            warn!(%label, %update_type, error = %err, ?after, "leaf write failed, retrying");
        })
        .call();
        Ok(result?)
    }

    fn retry_policy(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(Duration::from_millis(self.config.retry_delay_ms))
            .with_max_times(self.config.store_retries.saturating_sub(1))
    }

    /// Moves to the terminal locked state and returns the error to report.
    fn lock(&mut self, reason: &str) -> PinWeaverError {
        error!(reason, "local tree diverged from the backend, locking manager");
        self.state = State::Locked;
        PinWeaverError::corruption(reason)
    }

    /// Runs `op`; on `OutOfSync` replays the backend log and runs it once
    /// more.
    fn with_sync_retry<T>(
        &mut self,
        mut op: impl FnMut(&mut Self) -> PinWeaverResult<T>,
    ) -> PinWeaverResult<T> {
        match op(self) {
            Err(PinWeaverError::OutOfSync) => {
                warn!("backend reports out of sync, replaying log");
                self.replay_log()?;
                op(self)
            }
            other => other,
        }
    }

    /// The stored leaf as a backend proof. Leaves whose metadata was lost are
    /// reported as absent.
    fn leaf_proof(&self, label: Label) -> PinWeaverResult<LeafProof> {
        let tree = self.tree()?;
        let leaf = tree.get_leaf(label)?;
        if leaf.metadata_lost {
            return Err(PinWeaverError::NotFound { label });
        }
        Ok(LeafProof {
            label,
            aux: tree.get_aux_hashes(label)?,
            metadata: leaf.metadata,
            mac: leaf.mac,
        })
    }

    fn usable_metadata(&self, label: Label) -> PinWeaverResult<Vec<u8>> {
        let leaf = self.tree()?.get_leaf(label)?;
        if leaf.metadata_lost {
            Err(PinWeaverError::NotFound { label })
        } else {
            Ok(leaf.metadata)
        }
    }

    const fn tree(&self) -> PinWeaverResult<&HashTree> {
        match &self.state {
            State::Ready(tree) => Ok(tree),
            State::Uninitialized { .. } => Err(PinWeaverError::NotInitialized),
            State::Locked => Err(PinWeaverError::Locked),
        }
    }

    const fn tree_mut(&mut self) -> PinWeaverResult<&mut HashTree> {
        match &mut self.state {
            State::Ready(tree) => Ok(tree),
            State::Uninitialized { .. } => Err(PinWeaverError::NotInitialized),
            State::Locked => Err(PinWeaverError::Locked),
        }
    }
}
