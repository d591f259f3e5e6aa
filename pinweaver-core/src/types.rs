//! Shared data model: hashes, delay schedules, policies and the records the
//! backend hands back to the manager.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use zeroize::Zeroizing;

use crate::hash_tree::Label;

/// A SHA-256 node value. Leaf nodes hold the leaf MAC.
pub type Hash = [u8; 32];

/// Hash of an empty leaf slot.
pub const EMPTY_HASH: Hash = [0u8; 32];

/// Secret bytes that are wiped from memory on drop.
pub type Secret = Zeroizing<Vec<u8>>;

// =============================================================================
// Delay schedule
// =============================================================================

/// Delay enforced once a wrong-attempt threshold is reached.
///
/// On the wire (and in metadata) the permanent lockout marker is `u32::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum Delay {
    /// Wait this many seconds after the last attempt.
    Seconds(u32),
    /// No further attempts until a reset.
    Infinite,
}

impl Delay {
    /// Returns `true` for the permanent lockout marker.
    #[must_use]
    pub const fn is_infinite(self) -> bool {
        matches!(self, Self::Infinite)
    }
}

impl From<u32> for Delay {
    fn from(value: u32) -> Self {
        if value == u32::MAX {
            Self::Infinite
        } else {
            Self::Seconds(value)
        }
    }
}

impl From<Delay> for u32 {
    fn from(value: Delay) -> Self {
        match value {
            Delay::Seconds(secs) => secs,
            Delay::Infinite => Self::MAX,
        }
    }
}

impl fmt::Display for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seconds(secs) => write!(f, "{secs}s"),
            Self::Infinite => f.write_str("infinite"),
        }
    }
}

/// Ordered mapping from wrong-attempt threshold to enforced delay.
///
/// Immutable once a leaf has been inserted; the backend copies it into the
/// leaf metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DelaySchedule(BTreeMap<u32, Delay>);

impl DelaySchedule {
    /// Creates an empty schedule (never delays).
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Schedule that locks the leaf permanently after `attempts` wrong tries.
    #[must_use]
    pub fn lockout_after(attempts: u32) -> Self {
        Self::new().with(attempts, Delay::Infinite)
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, attempts: u32, delay: Delay) -> Self {
        self.0.insert(attempts, delay);
        self
    }

    /// Inserts or replaces a threshold.
    pub fn insert(&mut self, attempts: u32, delay: Delay) {
        self.0.insert(attempts, delay);
    }

    /// Delay in force after `attempts` wrong tries: the entry with the
    /// greatest threshold not exceeding `attempts`, zero when none applies.
    #[must_use]
    pub fn effective_delay(&self, attempts: u32) -> Delay {
        self.0
            .range(..=attempts)
            .next_back()
            .map_or(Delay::Seconds(0), |(_, delay)| *delay)
    }

    /// Iterates thresholds in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, Delay)> + '_ {
        self.0.iter().map(|(attempts, delay)| (*attempts, *delay))
    }

    /// Number of thresholds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the schedule has no thresholds.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(u32, Delay)> for DelaySchedule {
    fn from_iter<T: IntoIterator<Item = (u32, Delay)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for DelaySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (attempts, delay) in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{attempts}:{delay}")?;
        }
        Ok(())
    }
}

/// Normalizes an expiration window: `None` and `Some(0)` both mean the leaf
/// never expires.
#[must_use]
pub const fn effective_expiration(delay: Option<u32>) -> Option<u32> {
    match delay {
        Some(0) | None => None,
        Some(secs) => Some(secs),
    }
}

// =============================================================================
// Policies and channels
// =============================================================================

/// A platform state under which a leaf may be used.
///
/// A leaf with an empty policy list is always usable; otherwise at least one
/// policy must match the state the backend observes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidPcrValue {
    /// Bitmask of the PCR registers covered by `digest`.
    pub bitmask: [u8; 2],
    /// Digest over the selected registers.
    pub digest: Vec<u8>,
}

/// External authentication channel a rate limiter is bound to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuthChannel {
    /// Fingerprint match-on-sensor.
    Fingerprint,
}

/// What a successful `ResetCredential` clears.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResetType {
    /// Clear the wrong-attempt counter only.
    WrongAttempts,
    /// Clear the counter and restart the expiration window from now.
    WrongAttemptsAndExpiration,
}

impl ResetType {
    /// Returns `true` if the reset also extends the expiration window.
    #[must_use]
    pub const fn extends_expiration(self) -> bool {
        matches!(self, Self::WrongAttemptsAndExpiration)
    }
}

// =============================================================================
// Backend log
// =============================================================================

/// Result of an authentication attempt as recorded by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum AuthOutcome {
    /// The attempt succeeded and the counter was cleared.
    Success,
    /// The attempt was charged against the counter.
    Failure,
}

/// Operation recorded in the backend's replay log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntryKind {
    /// A leaf was inserted with this MAC. Secrets are not logged.
    Insert {
        /// MAC of the inserted leaf.
        mac: Hash,
    },
    /// A leaf was removed.
    Remove,
    /// A check or biometrics attempt.
    Auth {
        /// Whether the counter was cleared or charged.
        outcome: AuthOutcome,
        /// Backend time of the attempt.
        timestamp: u64,
        /// MAC of the leaf after the attempt.
        mac: Hash,
    },
    /// A successful reset.
    Reset {
        /// Whether the expiration window was restarted.
        extend_expiration: bool,
        /// Backend time of the reset.
        timestamp: u64,
        /// MAC of the leaf after the reset.
        mac: Hash,
    },
    /// The whole tree was reset to empty.
    ResetTree,
}

/// One entry of the backend's bounded replay log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Backend root hash after the operation.
    pub root: Hash,
    /// Label the operation touched (zero for `ResetTree`).
    pub label: Label,
    /// What happened.
    pub kind: LogEntryKind,
}

// =============================================================================
// Replies
// =============================================================================

/// Secrets released by a successful `CheckCredential`.
pub struct CheckCredentialReply {
    /// The protected high-entropy secret.
    pub he_secret: Secret,
    /// The reset secret stored alongside it.
    pub reset_secret: Secret,
}

impl fmt::Debug for CheckCredentialReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckCredentialReply")
            .field("he_secret", &"[REDACTED]")
            .field("reset_secret", &"[REDACTED]")
            .finish()
    }
}

/// Reply to `StartBiometricsAuth`: the HE secret encrypted under a session
/// key derived from the channel pairing key and both nonces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartBiometricsAuthReply {
    /// Backend-chosen nonce.
    pub server_nonce: [u8; 32],
    /// AEAD nonce used for `encrypted_he_secret`.
    pub iv: [u8; 24],
    /// HE secret sealed with XChaCha20-Poly1305.
    pub encrypted_he_secret: Vec<u8>,
}

/// Public part of a leaf as decoded by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafInfo {
    /// Wrong attempts since the last success or reset.
    pub wrong_attempts: u32,
    /// Schedule fixed at insert.
    pub delay_schedule: DelaySchedule,
    /// Expiration window fixed at insert (`None` when disabled).
    pub expiration_delay: Option<u32>,
    /// Channel for rate limiters, `None` for credentials.
    pub auth_channel: Option<AuthChannel>,
    /// Policies the leaf is bound to.
    pub policies: Vec<ValidPcrValue>,
}
