//! Leaf metadata as encoded by the software backend.
//!
//! The manager treats these bytes as opaque. The public part is readable by
//! anyone holding the bytes; the secrets are sealed once at insert and the
//! ciphertext is carried unchanged through every later update, so replaying
//! a logged operation reproduces the exact same bytes.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::backend::{BackendError, BackendResult};
use crate::types::{AuthChannel, Delay, DelaySchedule, LeafInfo, ValidPcrValue};

use super::crypto::NONCE_SIZE;

/// Current metadata layout version.
pub(super) const METADATA_VERSION: u8 = 1;

/// Counters and parameters of a leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct PublicMetadata {
    pub(super) version: u8,
    pub(super) label: u64,
    pub(super) wrong_attempts: u32,
    pub(super) delay_schedule: DelaySchedule,
    pub(super) policies: Vec<ValidPcrValue>,
    pub(super) expiration_delay: Option<u32>,
    pub(super) expiration_timestamp: Option<u64>,
    pub(super) last_access: u64,
    pub(super) auth_channel: Option<AuthChannel>,
}

impl PublicMetadata {
    /// Seconds until another attempt is allowed at `now`.
    pub(super) fn remaining_delay(&self, now: u64) -> u32 {
        match self.delay_schedule.effective_delay(self.wrong_attempts) {
            Delay::Infinite => u32::MAX,
            Delay::Seconds(delay) => {
                let ready_at = self.last_access.saturating_add(u64::from(delay));
                clamp_u32(ready_at.saturating_sub(now))
            }
        }
    }

    /// Seconds until expiry at `now`, `None` if the leaf never expires.
    pub(super) fn remaining_expiration(&self, now: u64) -> Option<u32> {
        self.expiration_timestamp
            .map(|expires_at| clamp_u32(expires_at.saturating_sub(now)))
    }

    pub(super) fn is_expired(&self, now: u64) -> bool {
        self.expiration_timestamp
            .is_some_and(|expires_at| now >= expires_at)
    }

    pub(super) fn info(&self) -> LeafInfo {
        LeafInfo {
            wrong_attempts: self.wrong_attempts,
            delay_schedule: self.delay_schedule.clone(),
            expiration_delay: self.expiration_delay,
            auth_channel: self.auth_channel,
            policies: self.policies.clone(),
        }
    }
}

/// Secrets of a leaf, sealed inside the metadata.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(super) struct SealedSecrets {
    pub(super) le: Vec<u8>,
    pub(super) he: Vec<u8>,
    pub(super) reset: Vec<u8>,
}

impl SealedSecrets {
    pub(super) fn to_cbor(&self) -> BackendResult<zeroize::Zeroizing<Vec<u8>>> {
        let mut bytes = zeroize::Zeroizing::new(Vec::new());
        ciborium::into_writer(self, &mut *bytes).map_err(|e| BackendError::Hardware {
            reason: format!("encoding secrets: {e}"),
        })?;
        Ok(bytes)
    }

    pub(super) fn from_cbor(bytes: &[u8]) -> BackendResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| BackendError::InvalidLeaf {
            reason: format!("decoding secrets: {e}"),
        })
    }
}

/// The full metadata blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct LeafMetadata {
    pub(super) public: PublicMetadata,
    pub(super) nonce: [u8; NONCE_SIZE],
    pub(super) sealed: Vec<u8>,
}

impl LeafMetadata {
    pub(super) fn encode(&self) -> BackendResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes).map_err(|e| BackendError::Hardware {
            reason: format!("encoding metadata: {e}"),
        })?;
        Ok(bytes)
    }

    pub(super) fn decode(bytes: &[u8]) -> BackendResult<Self> {
        let metadata: Self = ciborium::from_reader(bytes).map_err(|e| BackendError::InvalidLeaf {
            reason: format!("metadata does not decode: {e}"),
        })?;
        if metadata.public.version != METADATA_VERSION {
            return Err(BackendError::InvalidLeaf {
                reason: format!("unsupported metadata version {}", metadata.public.version),
            });
        }
        Ok(metadata)
    }
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
