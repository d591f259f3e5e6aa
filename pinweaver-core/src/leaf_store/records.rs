//! Records of the append-only data region.
//!
//! Every record is wrapped in a [`RecordEnvelope`] carrying magic bytes, type,
//! version, length and a CRC32 over everything but the magic.

// Binary format code uses small constant casts that are safe
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::doc_markdown)]

use crate::storage::StorageError;
use crate::types::Hash;

use super::format::{
    HASH_SIZE, LEAF_FLAG_METADATA_LOST, RECORD_ENVELOPE_HEADER_SIZE, RECORD_MAGIC,
    RECORD_TYPE_LEAF, RECORD_TYPE_TXN_BEGIN, RECORD_TYPE_TXN_COMMIT, RECORD_VERSION,
};

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn envelope_crc(header: &[u8], body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header[4..12]);
    hasher.update(body);
    hasher.finalize()
}

// =============================================================================
// Record Envelope
// =============================================================================

/// Common envelope wrapping all record types in the data region.
///
/// # Binary Layout
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       4     magic ("PWRC")
/// 4       2     record_type (u16 LE)
/// 6       2     record_version (u16 LE)
/// 8       4     body_len (u32 LE)
/// 12      4     crc32 (over type + version + body_len + body)
/// 16      N     body
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEnvelope {
    /// Type of record contained in this envelope.
    pub record_type: u16,
    /// Version of the record format.
    pub record_version: u16,
    /// Record body bytes.
    pub body: Vec<u8>,
}

impl RecordEnvelope {
    /// Creates a new record envelope.
    #[must_use]
    pub const fn new(record_type: u16, body: Vec<u8>) -> Self {
        Self {
            record_type,
            record_version: RECORD_VERSION,
            body,
        }
    }

    /// Encodes the envelope to bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_ENVELOPE_HEADER_SIZE + self.body.len());
        buf.extend_from_slice(RECORD_MAGIC);
        buf.extend_from_slice(&self.record_type.to_le_bytes());
        buf.extend_from_slice(&self.record_version.to_le_bytes());
        buf.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        let crc = envelope_crc(&buf, &self.body);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Decodes an envelope from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is short or the magic or CRC do not
    /// match.
    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let body_len = Self::peek_body_len(bytes)? as usize;

        if &bytes[0..4] != RECORD_MAGIC {
            return Err(StorageError::InvalidMagic {
                expected: RECORD_MAGIC,
                found: bytes[0..4].to_vec(),
            });
        }

        let total_len = RECORD_ENVELOPE_HEADER_SIZE + body_len;
        if bytes.len() < total_len {
            return Err(StorageError::UnexpectedEof {
                context: format!(
                    "record body too short: expected {body_len}, got {}",
                    bytes.len() - RECORD_ENVELOPE_HEADER_SIZE
                ),
            });
        }

        let body = &bytes[RECORD_ENVELOPE_HEADER_SIZE..total_len];
        if envelope_crc(bytes, body) != le_u32(&bytes[12..16]) {
            return Err(StorageError::ChecksumMismatch {
                context: "record envelope CRC mismatch".to_string(),
            });
        }

        Ok(Self {
            record_type: u16::from_le_bytes([bytes[4], bytes[5]]),
            record_version: u16::from_le_bytes([bytes[6], bytes[7]]),
            body: body.to_vec(),
        })
    }

    /// Reads the body length from an envelope header.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is too short.
    pub fn peek_body_len(header_bytes: &[u8]) -> Result<u32, StorageError> {
        if header_bytes.len() < RECORD_ENVELOPE_HEADER_SIZE {
            return Err(StorageError::UnexpectedEof {
                context: "record envelope header too short".to_string(),
            });
        }
        Ok(le_u32(&header_bytes[8..12]))
    }

    /// Fails unless this envelope carries `expected` records.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CorruptedData`] on a type mismatch.
    pub fn expect_type(&self, expected: u16, what: &str) -> Result<(), StorageError> {
        if self.record_type == expected {
            Ok(())
        } else {
            Err(StorageError::corrupted(format!(
                "expected {what} record, got type {}",
                self.record_type
            )))
        }
    }
}

// =============================================================================
// TxnBegin / TxnCommit
// =============================================================================

/// Transaction begin marker.
///
/// Body: txn_id(16) + started_at(8, u64 LE).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnBegin {
    /// Random transaction ID.
    pub txn_id: [u8; 16],
    /// Unix timestamp when the transaction started.
    pub started_at: u64,
}

impl TxnBegin {
    /// Size of the encoded body.
    pub const BODY_SIZE: usize = 24;

    /// Creates a new transaction begin record.
    #[must_use]
    pub const fn new(txn_id: [u8; 16], started_at: u64) -> Self {
        Self { txn_id, started_at }
    }

    /// Wraps the record in an envelope.
    #[must_use]
    pub fn to_envelope(&self) -> RecordEnvelope {
        let mut body = Vec::with_capacity(Self::BODY_SIZE);
        body.extend_from_slice(&self.txn_id);
        body.extend_from_slice(&self.started_at.to_le_bytes());
        RecordEnvelope::new(RECORD_TYPE_TXN_BEGIN, body)
    }
}

/// Transaction commit with the index pointer.
///
/// # Binary Layout (68 bytes)
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       16    txn_id
/// 16      8     index_offset (u64 LE)
/// 24      4     index_len (u32 LE)
/// 28      32    index_hash (SHA256 of the index body)
/// 60      8     committed_at (u64 LE, Unix timestamp)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnCommit {
    /// Transaction ID (matches TxnBegin).
    pub txn_id: [u8; 16],
    /// Byte offset of the IndexSnapshot record.
    pub index_offset: u64,
    /// Byte length of the index record.
    pub index_len: u32,
    /// SHA256 of the index record body.
    pub index_hash: [u8; HASH_SIZE],
    /// Unix timestamp when the transaction was committed.
    pub committed_at: u64,
}

impl TxnCommit {
    /// Size of the encoded body.
    pub const BODY_SIZE: usize = 68;

    /// Encodes to body bytes (without envelope).
    #[must_use]
    pub fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::BODY_SIZE);
        buf.extend_from_slice(&self.txn_id);
        buf.extend_from_slice(&self.index_offset.to_le_bytes());
        buf.extend_from_slice(&self.index_len.to_le_bytes());
        buf.extend_from_slice(&self.index_hash);
        buf.extend_from_slice(&self.committed_at.to_le_bytes());
        buf
    }

    /// Decodes from body bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is too short.
    pub fn decode_body(body: &[u8]) -> Result<Self, StorageError> {
        if body.len() < Self::BODY_SIZE {
            return Err(StorageError::UnexpectedEof {
                context: "TxnCommit body too short".to_string(),
            });
        }

        let mut txn_id = [0u8; 16];
        txn_id.copy_from_slice(&body[0..16]);
        let mut index_hash = [0u8; HASH_SIZE];
        index_hash.copy_from_slice(&body[28..60]);

        Ok(Self {
            txn_id,
            index_offset: le_u64(&body[16..24]),
            index_len: le_u32(&body[24..28]),
            index_hash,
            committed_at: le_u64(&body[60..68]),
        })
    }

    /// Wraps the record in an envelope.
    #[must_use]
    pub fn to_envelope(&self) -> RecordEnvelope {
        RecordEnvelope::new(RECORD_TYPE_TXN_COMMIT, self.encode_body())
    }
}

// =============================================================================
// LeafRecord
// =============================================================================

/// One version of a leaf: its MAC and the opaque metadata blob.
///
/// # Binary Layout (variable)
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       8     label (u64 LE)
/// 8       8     version (u64 LE)
/// 16      1     flags (bit 0: metadata lost)
/// 17      32    mac
/// 49      N     metadata
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafRecord {
    /// Leaf label.
    pub label: u64,
    /// Per-file version assigned by the writing transaction.
    pub version: u64,
    /// Flag bits.
    pub flags: u8,
    /// Leaf MAC, which is also the leaf's node hash.
    pub mac: Hash,
    /// Opaque backend metadata.
    pub metadata: Vec<u8>,
}

impl LeafRecord {
    /// Fixed header size before the metadata.
    pub const HEADER_SIZE: usize = 8 + 8 + 1 + HASH_SIZE;

    /// Returns `true` if the metadata was never confirmed by the backend.
    #[must_use]
    pub const fn metadata_lost(&self) -> bool {
        self.flags & LEAF_FLAG_METADATA_LOST != 0
    }

    /// Encodes to body bytes (without envelope).
    #[must_use]
    pub fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::HEADER_SIZE + self.metadata.len());
        buf.extend_from_slice(&self.label.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.push(self.flags);
        buf.extend_from_slice(&self.mac);
        buf.extend_from_slice(&self.metadata);
        buf
    }

    /// Decodes from body bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is shorter than the fixed header.
    pub fn decode_body(body: &[u8]) -> Result<Self, StorageError> {
        if body.len() < Self::HEADER_SIZE {
            return Err(StorageError::UnexpectedEof {
                context: "leaf record body too short".to_string(),
            });
        }

        let mut mac = [0u8; HASH_SIZE];
        mac.copy_from_slice(&body[17..Self::HEADER_SIZE]);

        Ok(Self {
            label: le_u64(&body[0..8]),
            version: le_u64(&body[8..16]),
            flags: body[16],
            mac,
            metadata: body[Self::HEADER_SIZE..].to_vec(),
        })
    }

    /// Wraps the record in an envelope.
    #[must_use]
    pub fn to_envelope(&self) -> RecordEnvelope {
        RecordEnvelope::new(RECORD_TYPE_LEAF, self.encode_body())
    }
}
