//! Leaf file transactions.

// Binary format code uses small constant casts that are safe
#![allow(clippy::cast_possible_truncation)]

use crate::storage::{LeafFileStore, StorageError};
use crate::types::Hash;

use super::file::LeafFile;
use super::format::LEAF_FLAG_METADATA_LOST;
use super::index::{LeafIndex, LeafPointer};
use super::records::LeafRecord;

/// An in-progress transaction over a [`LeafFile`].
///
/// Leaf records are appended as they are written but stay unreachable until
/// [`LeafTxn::commit`] publishes the new index through a superblock. Dropping
/// the transaction discards it.
pub struct LeafTxn<'a, V: LeafFileStore + ?Sized> {
    file: &'a mut LeafFile<V>,
    txn_id: [u8; 16],
    index: LeafIndex,
}

impl<'a, V: LeafFileStore + ?Sized> LeafTxn<'a, V> {
    /// Appends a `TxnBegin` record and snapshots the committed index.
    pub(super) fn begin(file: &'a mut LeafFile<V>) -> Result<Self, StorageError> {
        let txn_id = file.begin_record()?;
        let index = file.index().clone();
        Ok(Self {
            file,
            txn_id,
            index,
        })
    }

    /// Writes a new version of `label`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be appended.
    pub fn put_leaf(
        &mut self,
        label: u64,
        mac: Hash,
        metadata: &[u8],
        metadata_lost: bool,
    ) -> Result<(), StorageError> {
        let version = self.index.next_version;
        let record = LeafRecord {
            label,
            version,
            flags: if metadata_lost {
                LEAF_FLAG_METADATA_LOST
            } else {
                0
            },
            mac,
            metadata: metadata.to_vec(),
        };
        let bytes = record.to_envelope().encode();
        let offset = self.file.store().append(&bytes)?;

        self.index.next_version = version.saturating_add(1);
        self.index.entries.insert(
            label,
            LeafPointer {
                offset,
                len: bytes.len() as u32,
                version,
                mac,
                metadata_lost,
            },
        );
        Ok(())
    }

    /// Drops `label` from the index. Returns `false` if it was not present.
    pub fn remove_leaf(&mut self, label: u64) -> bool {
        self.index.entries.remove(&label).is_some()
    }

    /// Drops every leaf.
    pub fn clear(&mut self) {
        self.index.entries.clear();
    }

    /// The index as it will be committed.
    #[must_use]
    pub const fn pending_index(&self) -> &LeafIndex {
        &self.index
    }

    /// Publishes the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if any write or sync fails. Before the superblock
    /// write lands, a failure leaves the committed state untouched.
    pub fn commit(self) -> Result<(), StorageError> {
        self.file.publish(self.txn_id, self.index)
    }
}
