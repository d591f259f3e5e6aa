//! [`LeafFile`]: the handle to an open leaf container.

// Binary format code uses small constant casts that are safe
#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::hash_tree::TreeGeometry;
use crate::storage::{LeafFileStore, StorageError};

use super::compaction::{should_compact, CompactImage};
use super::format::{
    DATA_REGION_START, FILE_HEADER_SIZE, HASH_SIZE, RECORD_ENVELOPE_HEADER_SIZE,
    RECORD_TYPE_INDEX_SNAPSHOT, RECORD_TYPE_LEAF, RECORD_TYPE_TXN_COMMIT, SUPERBLOCK_A_OFFSET,
    SUPERBLOCK_B_OFFSET, SUPERBLOCK_SIZE,
};
use super::header::{select_active_superblock, FileHeader, Superblock, SuperblockSlot};
use super::index::LeafIndex;
use super::records::{LeafRecord, RecordEnvelope, TxnBegin, TxnCommit};
use super::transaction::LeafTxn;

/// Handle to an open leaf file.
///
/// The committed index is cached in memory and replaced on every successful
/// commit. A failed commit leaves both the file's published state and the
/// cached index untouched. Commits that leave too many dead bytes behind
/// are followed by [`LeafFile::compact`].
///
/// `LeafFile` is not thread-safe; the owning hash tree is driven by a single
/// manager.
pub struct LeafFile<V: LeafFileStore + ?Sized> {
    store: Arc<V>,
    geometry: TreeGeometry,
    active_superblock: Superblock,
    active_slot: SuperblockSlot,
    index: LeafIndex,
}

impl<V: LeafFileStore + ?Sized> LeafFile<V> {
    /// Opens an existing leaf file.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotInitialized`] for a file without a data
    /// region, [`StorageError::GeometryMismatch`] if the file was created for
    /// another tree shape, [`StorageError::NoValidSuperblock`] if neither
    /// superblock survived, or a corruption error if the committed records
    /// do not check out.
    pub fn open(store: Arc<V>, geometry: TreeGeometry) -> Result<Self, StorageError> {
        if store.len()? < DATA_REGION_START {
            return Err(StorageError::NotInitialized);
        }

        let header = FileHeader::decode(&store.read_at(0, FILE_HEADER_SIZE as u32)?)?;
        header.check_geometry(geometry)?;

        let sb_a = Superblock::try_decode(&store.read_at(SUPERBLOCK_A_OFFSET, SUPERBLOCK_SIZE as u32)?);
        let sb_b = Superblock::try_decode(&store.read_at(SUPERBLOCK_B_OFFSET, SUPERBLOCK_SIZE as u32)?);
        let (active_superblock, active_slot) =
            select_active_superblock(sb_a, sb_b).ok_or(StorageError::NoValidSuperblock)?;

        let index = read_committed_index(store.as_ref(), &active_superblock)?;

        Ok(Self {
            store,
            geometry,
            active_superblock,
            active_slot,
            index,
        })
    }

    /// Initializes an empty store with a header and an empty committed index.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is not empty or a write fails.
    pub fn create(store: Arc<V>, geometry: TreeGeometry) -> Result<Self, StorageError> {
        if !store.is_empty()? {
            return Err(StorageError::internal(
                "cannot create leaf file: store is not empty",
            ));
        }

        store.set_len(DATA_REGION_START)?;
        store.write_at(0, &FileHeader::new(geometry).encode())?;

        // Generation 0 is never published; the first commit writes slot A
        // with generation 1.
        let mut file = Self {
            store,
            geometry,
            active_superblock: Superblock::new(0, 0, [0u8; HASH_SIZE]),
            active_slot: SuperblockSlot::B,
            index: LeafIndex::new(current_timestamp()),
        };
        file.with_txn(|_| Ok(()))?;
        Ok(file)
    }

    /// Opens the file, creating it first if the store is empty.
    ///
    /// # Errors
    ///
    /// See [`LeafFile::open`] and [`LeafFile::create`].
    pub fn open_or_create(store: Arc<V>, geometry: TreeGeometry) -> Result<Self, StorageError> {
        if store.is_empty()? {
            Self::create(store, geometry)
        } else {
            Self::open(store, geometry)
        }
    }

    /// Geometry recorded in the header.
    #[must_use]
    pub const fn geometry(&self) -> TreeGeometry {
        self.geometry
    }

    /// Generation of the active superblock.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.active_superblock.generation
    }

    /// The committed index.
    #[must_use]
    pub const fn index(&self) -> &LeafIndex {
        &self.index
    }

    /// Returns a reference to the underlying store.
    #[must_use]
    pub const fn store(&self) -> &Arc<V> {
        &self.store
    }

    /// Reads the committed record for `label`, or `None` if the slot is empty.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::StaleLeaf`] if the record on disk is a
    /// different version than the index expects, or a corruption error if
    /// the record does not decode or carries another label or MAC.
    pub fn read_leaf(&self, label: u64) -> Result<Option<LeafRecord>, StorageError> {
        let Some(pointer) = self.index.get(label) else {
            return Ok(None);
        };

        let envelope = RecordEnvelope::decode(&self.store.read_at(pointer.offset, pointer.len)?)?;
        envelope.expect_type(RECORD_TYPE_LEAF, "leaf")?;
        let record = LeafRecord::decode_body(&envelope.body)?;

        if record.label != label {
            return Err(StorageError::corrupted(format!(
                "leaf record at offset {} belongs to label {}, expected {label}",
                pointer.offset, record.label
            )));
        }
        if record.version != pointer.version {
            return Err(StorageError::StaleLeaf {
                label,
                expected: pointer.version,
                found: record.version,
            });
        }
        if record.mac != pointer.mac || record.metadata_lost() != pointer.metadata_lost {
            return Err(StorageError::corrupted(format!(
                "leaf record for label {label} does not match the index"
            )));
        }

        Ok(Some(record))
    }

    /// Runs `f` inside a transaction and commits it.
    ///
    /// Nothing becomes visible unless both `f` and the commit succeed.
    ///
    /// # Errors
    ///
    /// Returns the first error from `f` or the commit sequence.
    pub fn with_txn<R, F>(&mut self, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&mut LeafTxn<'_, V>) -> Result<R, StorageError>,
    {
        let mut txn = LeafTxn::begin(self)?;
        let result = f(&mut txn)?;
        txn.commit()?;
        self.compact_if_needed();
        Ok(result)
    }

    /// Bytes of the data region referenced by the committed leaf pointers.
    #[must_use]
    pub fn live_len(&self) -> u64 {
        self.index.entries.values().map(|p| u64::from(p.len)).sum()
    }

    /// Rewrites the live leaves to the front of the data region and
    /// truncates everything after them.
    ///
    /// The live image is first committed past the end of the file, which
    /// frees the front for a second copy that is committed in turn. Both
    /// steps go through a superblock, so every crash point leaves a
    /// committed index over the same leaves. Returns `false` when the front
    /// of the data region is too small to hold the image yet; the leaves
    /// then stay in the staged copy at the end.
    ///
    /// # Errors
    ///
    /// Returns an error if a live leaf cannot be read or a write fails.
    pub fn compact(&mut self) -> Result<bool, StorageError> {
        let records = self
            .index
            .entries
            .keys()
            .map(|&label| {
                self.read_leaf(label)?.ok_or_else(|| {
                    StorageError::internal(format!("indexed leaf {label} has no record"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let now = current_timestamp();

        let staged_at = self.store.len()?;
        let staged = CompactImage::build(staged_at, &records, &self.index, now)?;
        self.store.write_at(staged_at, &staged.bytes)?;
        self.promote(staged.commit_offset, &staged.commit, staged.index)?;

        let front = CompactImage::build(DATA_REGION_START, &records, &self.index, now)?;
        let end = DATA_REGION_START + front.len();
        if end > staged_at {
            return Ok(false);
        }
        self.store.write_at(DATA_REGION_START, &front.bytes)?;
        self.promote(front.commit_offset, &front.commit, front.index)?;
        self.store.set_len(end)?;
        self.store.sync()?;
        Ok(true)
    }

    /// Compacts when dead records dominate the data region.
    ///
    /// The preceding commit is already durable, so a failure here is logged
    /// and otherwise ignored.
    fn compact_if_needed(&mut self) {
        let data_len = match self.store.len() {
            Ok(len) => len.saturating_sub(DATA_REGION_START),
            Err(err) => {
                warn!(error = %err, "cannot size leaf file, skipping compaction");
                return;
            }
        };
        let live_len = self.live_len();
        if !should_compact(data_len, live_len) {
            return;
        }
        match self.compact() {
            Ok(true) => debug!(data_len, live_len, leaves = self.index.len(), "leaf file compacted"),
            Ok(false) => debug!(data_len, live_len, "leaf file compaction staged only"),
            Err(err) => warn!(error = %err, "leaf file compaction failed"),
        }
    }

    pub(super) fn begin_record(&self) -> Result<[u8; 16], StorageError> {
        let txn_id = *uuid::Uuid::new_v4().as_bytes();
        let begin = TxnBegin::new(txn_id, current_timestamp());
        self.store.append(&begin.to_envelope().encode())?;
        Ok(txn_id)
    }

    /// Publishes `index` with the commit sequence: index snapshot, commit
    /// record, sync, superblock in the other slot, sync.
    pub(super) fn publish(&mut self, txn_id: [u8; 16], mut index: LeafIndex) -> Result<(), StorageError> {
        let now = current_timestamp();
        index.bump_sequence(now);

        let index_body = index.to_cbor()?;
        let index_hash = sha256(&index_body);
        let index_bytes = RecordEnvelope::new(RECORD_TYPE_INDEX_SNAPSHOT, index_body).encode();
        let index_offset = self.store.append(&index_bytes)?;

        let commit = TxnCommit {
            txn_id,
            index_offset,
            index_len: index_bytes.len() as u32,
            index_hash,
            committed_at: now,
        };
        let commit_offset = self.store.append(&commit.to_envelope().encode())?;
        self.promote(commit_offset, &commit, index)
    }

    /// Syncs the records written so far, then points the inactive superblock
    /// at `commit` and makes `index` the committed one.
    fn promote(
        &mut self,
        commit_offset: u64,
        commit: &TxnCommit,
        index: LeafIndex,
    ) -> Result<(), StorageError> {
        self.store.sync()?;

        let slot = self.active_slot.other();
        let superblock = Superblock::new(
            self.active_superblock.generation + 1,
            commit_offset,
            sha256(&commit.encode_body()),
        );
        self.store.write_at(slot.offset(), &superblock.encode())?;
        self.store.sync()?;

        self.active_superblock = superblock;
        self.active_slot = slot;
        self.index = index;
        Ok(())
    }
}

impl<V: LeafFileStore + ?Sized> std::fmt::Debug for LeafFile<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafFile")
            .field("geometry", &self.geometry)
            .field("generation", &self.generation())
            .field("active_slot", &self.active_slot)
            .field("leaves", &self.index.len())
            .finish_non_exhaustive()
    }
}

fn read_committed_index<V: LeafFileStore + ?Sized>(
    store: &V,
    superblock: &Superblock,
) -> Result<LeafIndex, StorageError> {
    let offset = superblock.committed_txn_offset;
    let header = store.read_at(offset, RECORD_ENVELOPE_HEADER_SIZE as u32)?;
    let body_len = RecordEnvelope::peek_body_len(&header)?;
    let envelope = RecordEnvelope::decode(
        &store.read_at(offset, RECORD_ENVELOPE_HEADER_SIZE as u32 + body_len)?,
    )?;
    envelope.expect_type(RECORD_TYPE_TXN_COMMIT, "TxnCommit")?;
    if sha256(&envelope.body) != superblock.committed_txn_hash {
        return Err(StorageError::ChecksumMismatch {
            context: "committed transaction hash mismatch".to_string(),
        });
    }
    let commit = TxnCommit::decode_body(&envelope.body)?;

    let envelope = RecordEnvelope::decode(&store.read_at(commit.index_offset, commit.index_len)?)?;
    envelope.expect_type(RECORD_TYPE_INDEX_SNAPSHOT, "index")?;
    if sha256(&envelope.body) != commit.index_hash {
        return Err(StorageError::ChecksumMismatch {
            context: "index snapshot hash mismatch".to_string(),
        });
    }
    LeafIndex::from_cbor(&envelope.body)
}

pub(super) fn sha256(bytes: &[u8]) -> [u8; HASH_SIZE] {
    Sha256::digest(bytes).into()
}

pub(super) fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLeafFileStore;

    fn new_file() -> (Arc<MemoryLeafFileStore>, LeafFile<MemoryLeafFileStore>) {
        let store = Arc::new(MemoryLeafFileStore::new());
        let file = LeafFile::create(Arc::clone(&store), TreeGeometry::default()).unwrap();
        (store, file)
    }

    #[test]
    fn test_create_and_reopen() {
        let (store, mut file) = new_file();
        assert_eq!(file.generation(), 1);
        assert!(file.index().is_empty());

        file.with_txn(|txn| txn.put_leaf(5, [1u8; 32], b"meta", false))
            .unwrap();
        assert_eq!(file.generation(), 2);

        let reopened = LeafFile::open(store, TreeGeometry::default()).unwrap();
        assert_eq!(reopened.generation(), 2);
        let record = reopened.read_leaf(5).unwrap().unwrap();
        assert_eq!(record.mac, [1u8; 32]);
        assert_eq!(record.metadata, b"meta");
        assert!(reopened.read_leaf(6).unwrap().is_none());
    }

    #[test]
    fn test_geometry_mismatch_refused() {
        let (store, _file) = new_file();
        let other = TreeGeometry::new(1, 4).unwrap();
        assert!(matches!(
            LeafFile::open(store, other),
            Err(StorageError::GeometryMismatch { .. })
        ));
    }

    #[test]
    fn test_torn_transaction_is_ignored() {
        let (store, mut file) = new_file();
        file.with_txn(|txn| txn.put_leaf(1, [1u8; 32], b"first", false))
            .unwrap();

        // A transaction whose records reached the file but whose superblock
        // write never happened.
        let committed_len = store.len().unwrap();
        file.with_txn(|txn| txn.put_leaf(1, [2u8; 32], b"second", false))
            .unwrap();
        let mut bytes = store.snapshot().unwrap();
        let latest = file.active_slot.offset() as usize;
        bytes[latest..latest + SUPERBLOCK_SIZE as usize].fill(0);
        assert!(bytes.len() as u64 > committed_len);

        let torn = Arc::new(MemoryLeafFileStore::with_data(bytes));
        let reopened = LeafFile::open(torn, TreeGeometry::default()).unwrap();
        let record = reopened.read_leaf(1).unwrap().unwrap();
        assert_eq!(record.metadata, b"first");
        assert_eq!(record.mac, [1u8; 32]);
    }

    #[test]
    fn test_stale_record_detected() {
        let (store, mut file) = new_file();
        file.with_txn(|txn| txn.put_leaf(2, [1u8; 32], b"old", false))
            .unwrap();
        let old_pointer = file.index().get(2).cloned().unwrap();
        file.with_txn(|txn| txn.put_leaf(2, [2u8; 32], b"new", false))
            .unwrap();
        let new_pointer = file.index().get(2).cloned().unwrap();

        // Roll the record back by copying the old bytes over the new ones.
        let old_bytes = store.read_at(old_pointer.offset, old_pointer.len).unwrap();
        assert_eq!(old_pointer.len, new_pointer.len);
        store.write_at(new_pointer.offset, &old_bytes).unwrap();

        assert!(matches!(
            file.read_leaf(2),
            Err(StorageError::StaleLeaf {
                label: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_failed_commit_leaves_state_unchanged() {
        let (store, mut file) = new_file();
        file.with_txn(|txn| txn.put_leaf(3, [3u8; 32], b"kept", false))
            .unwrap();

        store.set_fail_writes(true);
        assert!(file
            .with_txn(|txn| txn.put_leaf(4, [4u8; 32], b"lost", false))
            .is_err());
        store.set_fail_writes(false);

        assert!(file.index().get(4).is_none());
        let reopened = LeafFile::open(store, TreeGeometry::default()).unwrap();
        assert!(reopened.read_leaf(4).unwrap().is_none());
        assert!(reopened.read_leaf(3).unwrap().is_some());
    }

    #[test]
    fn test_repeated_updates_keep_file_bounded() {
        let (store, mut file) = new_file();
        let metadata = [0x5Au8; 160];
        file.with_txn(|txn| {
            for label in 0..32 {
                txn.put_leaf(label, [0u8; 32], &metadata, false)?;
            }
            Ok(())
        })
        .unwrap();

        let mut largest = 0;
        for round in 0..600u32 {
            let label = u64::from(round % 32);
            let mac = [(round % 251) as u8; 32];
            file.with_txn(|txn| txn.put_leaf(label, mac, &metadata, false))
                .unwrap();
            largest = largest.max(store.len().unwrap());
        }

        // Without compaction 600 index snapshots alone would take megabytes.
        let bound = DATA_REGION_START
            + crate::leaf_store::COMPACTION_MIN_DEAD_BYTES
            + 4 * file.live_len()
            + 16 * 1024;
        assert!(largest < bound, "leaf file reached {largest} bytes");

        let reopened = LeafFile::open(store, TreeGeometry::default()).unwrap();
        assert_eq!(reopened.index().len(), 32);
        let record = reopened.read_leaf(599 % 32).unwrap().unwrap();
        assert_eq!(record.mac, [(599 % 251) as u8; 32]);
        assert_eq!(record.metadata, metadata);
    }

    #[test]
    fn test_compact_rewrites_live_leaves_at_front() {
        let (store, mut file) = new_file();
        for round in 0..20u8 {
            file.with_txn(|txn| {
                txn.put_leaf(1, [round; 32], b"one", false)?;
                txn.put_leaf(2, [round; 32], b"two", true)
            })
            .unwrap();
        }
        file.with_txn(|txn| Ok(txn.remove_leaf(2))).unwrap();
        let before = store.len().unwrap();
        let generation = file.generation();
        let versions = file.index().get(1).map(|p| p.version);

        assert!(file.compact().unwrap());
        assert!(store.len().unwrap() < before);
        assert_eq!(file.generation(), generation + 2);
        assert_eq!(file.index().get(1).map(|p| p.version), versions);
        assert!(file.index().get(1).unwrap().offset < before);

        file.with_txn(|txn| txn.put_leaf(3, [3u8; 32], b"three", false))
            .unwrap();
        let reopened = LeafFile::open(store, TreeGeometry::default()).unwrap();
        assert_eq!(reopened.read_leaf(1).unwrap().unwrap().mac, [19u8; 32]);
        assert!(reopened.read_leaf(2).unwrap().is_none());
        assert_eq!(reopened.read_leaf(3).unwrap().unwrap().metadata, b"three");
    }

    #[test]
    fn test_crash_between_compaction_steps_keeps_leaves() {
        let (store, mut file) = new_file();
        for round in 0..20u8 {
            file.with_txn(|txn| txn.put_leaf(7, [round; 32], b"seven", false))
                .unwrap();
        }
        let records = vec![file.read_leaf(7).unwrap().unwrap()];

        // Stage the image at the end and publish it, but never write the
        // front copy.
        let staged_at = store.len().unwrap();
        let staged = CompactImage::build(staged_at, &records, file.index(), 1).unwrap();
        store.write_at(staged_at, &staged.bytes).unwrap();
        file.promote(staged.commit_offset, &staged.commit, staged.index)
            .unwrap();

        // A torn front copy is never referenced.
        store.write_at(DATA_REGION_START, &[0xFFu8; 64]).unwrap();

        let reopened = LeafFile::open(store, TreeGeometry::default()).unwrap();
        assert!(reopened.index().get(7).unwrap().offset >= staged_at);
        let record = reopened.read_leaf(7).unwrap().unwrap();
        assert_eq!(record.mac, [19u8; 32]);
        assert_eq!(record.metadata, b"seven");
    }
}
