//! Reclaiming space held by superseded records.
//!
//! Every commit appends a fresh index snapshot, and every leaf update appends
//! a new leaf record, so the data region only grows. Once the dead bytes
//! outweigh the live ones, [`LeafFile::compact`](super::LeafFile::compact)
//! rewrites the live leaves as a single transaction at the front of the data
//! region and truncates the rest.

// Binary format code uses small constant casts that are safe
#![allow(clippy::cast_possible_truncation)]

use crate::storage::StorageError;

use super::file::sha256;
use super::format::RECORD_TYPE_INDEX_SNAPSHOT;
use super::index::{LeafIndex, LeafPointer};
use super::records::{LeafRecord, RecordEnvelope, TxnBegin, TxnCommit};

/// Dead bytes tolerated regardless of how few leaves are live.
pub const COMPACTION_MIN_DEAD_BYTES: u64 = 64 * 1024;

/// Dead bytes tolerated per live byte before compacting.
pub const COMPACTION_DEAD_RATIO: u64 = 2;

/// Returns `true` once a data region of `data_len` bytes, of which
/// `live_len` are still referenced, is worth compacting.
#[must_use]
pub const fn should_compact(data_len: u64, live_len: u64) -> bool {
    let dead = data_len.saturating_sub(live_len);
    let allowance = live_len.saturating_mul(COMPACTION_DEAD_RATIO);
    let allowance = if allowance > COMPACTION_MIN_DEAD_BYTES {
        allowance
    } else {
        COMPACTION_MIN_DEAD_BYTES
    };
    dead > allowance
}

/// One self-contained transaction holding every live leaf, encoded for a
/// fixed position in the file.
pub(super) struct CompactImage {
    pub(super) bytes: Vec<u8>,
    pub(super) index: LeafIndex,
    pub(super) commit: TxnCommit,
    pub(super) commit_offset: u64,
}

impl CompactImage {
    /// Lays out `records` starting at byte `base`.
    ///
    /// Record versions are kept, so pointers in the new index still catch a
    /// rolled-back record.
    pub(super) fn build(
        base: u64,
        records: &[LeafRecord],
        committed: &LeafIndex,
        now: u64,
    ) -> Result<Self, StorageError> {
        let txn_id = *uuid::Uuid::new_v4().as_bytes();
        let mut bytes = TxnBegin::new(txn_id, now).to_envelope().encode();

        let mut index = committed.clone();
        index.entries.clear();
        for record in records {
            let encoded = record.to_envelope().encode();
            index.entries.insert(
                record.label,
                LeafPointer {
                    offset: base + bytes.len() as u64,
                    len: encoded.len() as u32,
                    version: record.version,
                    mac: record.mac,
                    metadata_lost: record.metadata_lost(),
                },
            );
            bytes.extend_from_slice(&encoded);
        }
        index.bump_sequence(now);

        let index_body = index.to_cbor()?;
        let index_hash = sha256(&index_body);
        let index_bytes = RecordEnvelope::new(RECORD_TYPE_INDEX_SNAPSHOT, index_body).encode();
        let index_offset = base + bytes.len() as u64;
        bytes.extend_from_slice(&index_bytes);

        let commit = TxnCommit {
            txn_id,
            index_offset,
            index_len: index_bytes.len() as u32,
            index_hash,
            committed_at: now,
        };
        let commit_offset = base + bytes.len() as u64;
        bytes.extend_from_slice(&commit.to_envelope().encode());

        Ok(Self {
            bytes,
            index,
            commit,
            commit_offset,
        })
    }

    /// Encoded length in bytes.
    pub(super) const fn len(&self) -> u64 {
        self.bytes.len() as u64
    }
}
