//! The secure-element side of PinWeaver.
//!
//! A backend owns the authoritative root hash and the secrets sealed into
//! leaf metadata. The manager hands it a leaf (metadata, MAC and aux hashes)
//! and persists whatever the backend returns.

pub mod software;

use thiserror::Error;

use crate::hash_tree::{Label, TreeGeometry};
use crate::types::{
    AuthChannel, AuthOutcome, CheckCredentialReply, DelaySchedule, Hash, LeafInfo, LogEntry,
    ResetType, Secret, StartBiometricsAuthReply, ValidPcrValue,
};

pub use software::{Clock, ManualClock, SoftwareBackend, SystemClock};

/// Errors reported by a backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The root derived from the supplied aux hashes is not the backend's.
    #[error("root hash out of sync")]
    OutOfSync,
    /// Too many wrong attempts.
    #[error("locked out for {delay_seconds}s")]
    LockedOut {
        /// Seconds until the next attempt, `u32::MAX` when permanent.
        delay_seconds: u32,
    },
    /// The leaf's expiration window has passed.
    #[error("leaf expired")]
    Expired,
    /// The leaf MAC or metadata failed verification.
    #[error("invalid leaf: {reason}")]
    InvalidLeaf {
        /// What failed.
        reason: String,
    },
    /// No policy of the leaf matches the platform state.
    #[error("no policy matches the platform state")]
    PolicyNotMatch,
    /// A rate limiter was requested on a channel without a pairing key.
    #[error("auth channel {channel} is not paired")]
    ChannelNotPaired {
        /// The channel.
        channel: AuthChannel,
    },
    /// A request field is out of range.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong.
        reason: String,
    },
    /// Transport or hardware failure.
    #[error("hardware error: {reason}")]
    Hardware {
        /// Diagnostic.
        reason: String,
    },
    /// The backend has never been given a tree.
    #[error("tree not provisioned")]
    NotProvisioned,
}

/// Result type for backend calls.
pub type BackendResult<T> = Result<T, BackendError>;

/// A stored leaf as presented to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafProof {
    /// Leaf label.
    pub label: Label,
    /// Opaque metadata as last returned by the backend.
    pub metadata: Vec<u8>,
    /// MAC as last returned by the backend.
    pub mac: Hash,
    /// Sibling hashes from the local tree.
    pub aux: Vec<Hash>,
}

/// Parameters of a new leaf.
///
/// `le_secret` and `he_secret` are `None` for a rate limiter: it has no
/// low-entropy secret and the backend picks the high-entropy one.
pub struct InsertLeafRequest {
    /// Slot to fill; must currently be empty.
    pub label: Label,
    /// Sibling hashes of the empty slot.
    pub aux: Vec<Hash>,
    /// Low-entropy secret.
    pub le_secret: Option<Secret>,
    /// High-entropy secret released on success.
    pub he_secret: Option<Secret>,
    /// Secret accepted by `reset_leaf`.
    pub reset_secret: Secret,
    /// Wrong-attempt thresholds.
    pub delay_schedule: DelaySchedule,
    /// Platform states the leaf is bound to.
    pub policies: Vec<ValidPcrValue>,
    /// Expiration window in seconds.
    pub expiration_delay: Option<u32>,
    /// Channel for rate limiters.
    pub auth_channel: Option<AuthChannel>,
}

impl std::fmt::Debug for InsertLeafRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertLeafRequest")
            .field("label", &self.label)
            .field("delay_schedule", &self.delay_schedule)
            .field("expiration_delay", &self.expiration_delay)
            .field("auth_channel", &self.auth_channel)
            .finish_non_exhaustive()
    }
}

/// New leaf contents and the backend root after an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafUpdate {
    /// New metadata.
    pub metadata: Vec<u8>,
    /// New MAC.
    pub mac: Hash,
    /// Backend root after the update.
    pub root: Hash,
}

/// Outcome of `check_leaf`. A wrong secret is not an error here: the
/// charged attempt must still be persisted.
#[derive(Debug)]
pub struct CheckLeafReply {
    /// Updated leaf.
    pub update: LeafUpdate,
    /// Released secrets, `None` for a wrong secret.
    pub secrets: Option<CheckCredentialReply>,
}

impl CheckLeafReply {
    /// Whether the attempt succeeded.
    #[must_use]
    pub const fn outcome(&self) -> AuthOutcome {
        if self.secrets.is_some() {
            AuthOutcome::Success
        } else {
            AuthOutcome::Failure
        }
    }
}

/// Outcome of `reset_leaf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetLeafReply {
    /// The reset secret matched.
    Reset(LeafUpdate),
    /// The reset secret did not match; nothing changed.
    WrongSecret,
}

/// Outcome of `start_biometrics_auth`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiometricsAuthReply {
    /// Leaf with one more attempt charged.
    pub update: LeafUpdate,
    /// Session material for the external verifier.
    pub reply: StartBiometricsAuthReply,
}

/// Metadata and MAC recomputed by replaying a log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedLeaf {
    /// Metadata after the logged operation.
    pub metadata: Vec<u8>,
    /// MAC after the logged operation.
    pub mac: Hash,
}

/// The secure element.
///
/// Calls are synchronous and not reentrant. Every mutating call verifies the
/// supplied leaf against the backend root before changing anything.
pub trait PinWeaverBackend: Send {
    /// Replaces the backend tree with an empty one of `geometry` and returns
    /// its root.
    ///
    /// # Errors
    ///
    /// Returns an error if the geometry is unsupported or the backend fails.
    fn reset_tree(&mut self, geometry: TreeGeometry) -> BackendResult<Hash>;

    /// The authoritative root.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::NotProvisioned`] before the first
    /// `reset_tree`.
    fn get_root_hash(&mut self) -> BackendResult<Hash>;

    /// Creates a leaf in an empty slot.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::OutOfSync`] if the aux hashes do not prove the
    /// slot empty, or [`BackendError::InvalidArgument`] for a bad schedule.
    fn insert_leaf(&mut self, request: InsertLeafRequest) -> BackendResult<LeafUpdate>;

    /// Attempts `le_secret` against a credential leaf.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::LockedOut`], [`BackendError::Expired`] or
    /// [`BackendError::PolicyNotMatch`] before the secret is looked at.
    fn check_leaf(&mut self, proof: &LeafProof, le_secret: &[u8]) -> BackendResult<CheckLeafReply>;

    /// Clears the wrong-attempt counter if `reset_secret` matches.
    ///
    /// # Errors
    ///
    /// Returns an error if the leaf fails verification.
    fn reset_leaf(
        &mut self,
        proof: &LeafProof,
        reset_secret: &[u8],
        reset_type: ResetType,
    ) -> BackendResult<ResetLeafReply>;

    /// Empties the slot of `label` and returns the new root.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::OutOfSync`] if `mac` and `aux` do not prove
    /// the leaf.
    fn remove_leaf(&mut self, label: Label, aux: &[Hash], mac: &Hash) -> BackendResult<Hash>;

    /// Pairs `channel` with the client's X25519 key and returns the backend
    /// public key.
    ///
    /// # Errors
    ///
    /// Returns an error if key agreement fails.
    fn generate_pk(
        &mut self,
        channel: AuthChannel,
        client_public_key: &[u8; 32],
    ) -> BackendResult<[u8; 32]>;

    /// Charges one attempt on a rate limiter and returns its HE secret
    /// encrypted for the paired channel.
    ///
    /// # Errors
    ///
    /// As for `check_leaf`, plus [`BackendError::ChannelNotPaired`].
    fn start_biometrics_auth(
        &mut self,
        proof: &LeafProof,
        channel: AuthChannel,
        client_nonce: &[u8; 32],
    ) -> BackendResult<BiometricsAuthReply>;

    /// Log entries after the newest one whose root is `root`, oldest first;
    /// the whole log if `root` does not appear.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    fn get_log(&mut self, root: &Hash) -> BackendResult<Vec<LogEntry>>;

    /// Re-applies the logged operation that produced `log_root` to the
    /// leaf's last known metadata.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::OutOfSync`] if the result does not reproduce
    /// `log_root`, or [`BackendError::InvalidArgument`] if no such entry is
    /// logged.
    fn replay_log_operation(
        &mut self,
        label: Label,
        log_root: &Hash,
        aux: &[Hash],
        metadata: &[u8],
    ) -> BackendResult<ReplayedLeaf>;

    /// Decodes the public part of `metadata`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::InvalidLeaf`] if the metadata does not decode.
    fn leaf_info(&self, metadata: &[u8]) -> BackendResult<LeafInfo>;

    /// Seconds until the leaf accepts another attempt (`u32::MAX` when
    /// locked permanently).
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::InvalidLeaf`] if the metadata does not decode.
    fn delay_in_seconds(&self, metadata: &[u8]) -> BackendResult<u32>;

    /// Seconds until the leaf expires, `None` if it never does.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::InvalidLeaf`] if the metadata does not decode.
    fn expiration_in_seconds(&self, metadata: &[u8]) -> BackendResult<Option<u32>>;
}
