//! Everything the software backend must remember across restarts.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, BackendResult};
use crate::hash_tree::TreeGeometry;
use crate::types::{AuthChannel, Hash, LogEntry};

use super::crypto::{BackendKeys, PairingKey};

/// Current state blob version.
const STATE_VERSION: u32 = 1;

/// The provisioned tree: its shape and authoritative root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct ProvisionedTree {
    pub(super) geometry: TreeGeometry,
    pub(super) root: Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct BackendState {
    version: u32,
    pub(super) keys: BackendKeys,
    pub(super) tree: Option<ProvisionedTree>,
    pub(super) log: VecDeque<LogEntry>,
    pub(super) pairings: BTreeMap<AuthChannel, PairingKey>,
}

impl BackendState {
    pub(super) fn generate() -> Self {
        Self {
            version: STATE_VERSION,
            keys: BackendKeys::generate(),
            tree: None,
            log: VecDeque::new(),
            pairings: BTreeMap::new(),
        }
    }

    pub(super) fn tree(&self) -> BackendResult<ProvisionedTree> {
        self.tree.ok_or(BackendError::NotProvisioned)
    }

    /// Appends to the log, evicting the oldest entries beyond `capacity`.
    pub(super) fn push_log(&mut self, entry: LogEntry, capacity: usize) {
        self.log.push_back(entry);
        while self.log.len() > capacity {
            self.log.pop_front();
        }
    }

    pub(super) fn to_cbor(&self) -> BackendResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes).map_err(|e| BackendError::Hardware {
            reason: format!("encoding backend state: {e}"),
        })?;
        Ok(bytes)
    }

    pub(super) fn from_cbor(bytes: &[u8]) -> BackendResult<Self> {
        let state: Self = ciborium::from_reader(bytes).map_err(|e| BackendError::Hardware {
            reason: format!("backend state does not decode: {e}"),
        })?;
        if state.version != STATE_VERSION {
            return Err(BackendError::Hardware {
                reason: format!("unsupported backend state version {}", state.version),
            });
        }
        Ok(state)
    }
}
