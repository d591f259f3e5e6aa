//! The label index committed with every transaction.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::storage::StorageError;
use crate::types::Hash;

/// Current version of the index format.
pub const LEAF_INDEX_VERSION: u32 = 1;

/// Where the current record of one leaf lives, and what it must contain.
///
/// `version` and `mac` are checked against the record on every read, so an
/// older record swapped in at the same offset is detected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafPointer {
    /// Byte offset of the leaf record envelope.
    pub offset: u64,
    /// Byte length of the leaf record envelope.
    pub len: u32,
    /// Version written into the record.
    pub version: u64,
    /// MAC written into the record.
    pub mac: Hash,
    /// The backend never confirmed this leaf's metadata.
    pub metadata_lost: bool,
}

/// Map from label to leaf pointer, snapshotted on each commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafIndex {
    /// Format version for migration support.
    pub index_version: u32,
    /// Bumped on every commit.
    pub sequence: u64,
    /// Unix timestamp of the last commit.
    pub updated_at: u64,
    /// Next version handed to a leaf record.
    pub next_version: u64,
    /// Current pointer per label.
    pub entries: BTreeMap<u64, LeafPointer>,
}

impl LeafIndex {
    /// Creates an empty index.
    #[must_use]
    pub const fn new(now: u64) -> Self {
        Self {
            index_version: LEAF_INDEX_VERSION,
            sequence: 0,
            updated_at: now,
            next_version: 1,
            entries: BTreeMap::new(),
        }
    }

    /// Looks up the pointer for `label`.
    #[must_use]
    pub fn get(&self, label: u64) -> Option<&LeafPointer> {
        self.entries.get(&label)
    }

    /// Number of stored leaves.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no leaf is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bumps the sequence number and timestamp.
    pub fn bump_sequence(&mut self, now: u64) {
        self.sequence = self.sequence.saturating_add(1);
        self.updated_at = now;
    }

    /// Serializes to CBOR.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] if encoding fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, StorageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserializes from CBOR.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] if the bytes are not a valid
    /// index.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, StorageError> {
        let index: Self =
            ciborium::from_reader(bytes).map_err(|e| StorageError::serialization(e.to_string()))?;
        if index.index_version != LEAF_INDEX_VERSION {
            return Err(StorageError::InvalidVersion {
                expected: LEAF_INDEX_VERSION,
                found: index.index_version,
            });
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_cbor() {
        let mut index = LeafIndex::new(100);
        index.entries.insert(
            3,
            LeafPointer {
                offset: 200,
                len: 90,
                version: 1,
                mac: [9u8; 32],
                metadata_lost: false,
            },
        );
        index.bump_sequence(101);

        let decoded = LeafIndex::from_cbor(&index.to_cbor().unwrap()).unwrap();
        assert_eq!(decoded, index);
        assert_eq!(decoded.sequence, 1);
        assert_eq!(decoded.get(3).map(|p| p.offset), Some(200));
        assert!(LeafIndex::from_cbor(b"garbage").is_err());
    }
}
