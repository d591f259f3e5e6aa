//! Persisted inner-node cache (`hash_cache.cbor`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::storage::StorageError;
use crate::types::Hash;

use super::TreeGeometry;

/// One memoized inner node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CachedNode {
    level: u8,
    index: u64,
    hash: Hash,
}

/// Snapshot of the non-default inner nodes, valid for one leaf-file
/// generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(super) struct HashCache {
    generation: u64,
    geometry: TreeGeometry,
    nodes: Vec<CachedNode>,
}

impl HashCache {
    pub(super) fn new(
        generation: u64,
        geometry: TreeGeometry,
        nodes: &HashMap<(u8, u64), Hash>,
    ) -> Self {
        let mut nodes: Vec<_> = nodes
            .iter()
            .map(|(&(level, index), hash)| CachedNode {
                level,
                index,
                hash: *hash,
            })
            .collect();
        nodes.sort_by_key(|node| (node.level, node.index));
        Self {
            generation,
            geometry,
            nodes,
        }
    }

    /// Returns the nodes if the cache was written for this exact leaf file
    /// state, `None` otherwise.
    pub(super) fn into_nodes(
        self,
        generation: u64,
        geometry: TreeGeometry,
    ) -> Option<HashMap<(u8, u64), Hash>> {
        if self.generation != generation || self.geometry != geometry {
            return None;
        }
        Some(
            self.nodes
                .into_iter()
                .map(|node| ((node.level, node.index), node.hash))
                .collect(),
        )
    }

    pub(super) fn to_cbor(&self) -> Result<Vec<u8>, StorageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        Ok(bytes)
    }

    pub(super) fn from_cbor(bytes: &[u8]) -> Result<Self, StorageError> {
        ciborium::from_reader(bytes).map_err(|e| StorageError::serialization(e.to_string()))
    }
}
