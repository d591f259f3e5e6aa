//! File header and superblocks.
//!
//! The header pins the tree geometry the file was created for. The two
//! superblocks point at the last committed transaction; whichever valid one
//! has the higher generation wins.

// Binary format code uses small constant casts that are safe
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::doc_markdown)]

use crate::hash_tree::TreeGeometry;
use crate::storage::StorageError;

use super::format::{
    FILE_HEADER_SIZE, FILE_MAGIC, FORMAT_VERSION, HASH_SIZE, SUPERBLOCK_A_OFFSET,
    SUPERBLOCK_B_OFFSET, SUPERBLOCK_MAGIC, SUPERBLOCK_SIZE,
};

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

// =============================================================================
// FileHeader
// =============================================================================

/// Header at offset 0 of every leaf file.
///
/// # Binary Layout (20 bytes)
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       8     magic ("PWLEAVES")
/// 8       4     format_version (u32 LE)
/// 12      1     bits_per_level
/// 13      1     height
/// 14      2     reserved (zero)
/// 16      4     crc32 (over bytes 0..16)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Format version for migration support.
    pub format_version: u32,
    /// Geometry of the tree the leaves belong to.
    pub geometry: TreeGeometry,
}

impl FileHeader {
    /// Creates a header for a tree with `geometry`.
    #[must_use]
    pub const fn new(geometry: TreeGeometry) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            geometry,
        }
    }

    /// Encodes the header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE as usize] {
        let mut buf = [0u8; FILE_HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(FILE_MAGIC);
        buf[8..12].copy_from_slice(&self.format_version.to_le_bytes());
        buf[12] = self.geometry.bits_per_level;
        buf[13] = self.geometry.height;
        let crc = crc32fast::hash(&buf[0..16]);
        buf[16..20].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a header from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is short, the magic or CRC do not match,
    /// or the format version is unsupported.
    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        if bytes.len() < FILE_HEADER_SIZE as usize {
            return Err(StorageError::UnexpectedEof {
                context: "file header too short".to_string(),
            });
        }

        if &bytes[0..8] != FILE_MAGIC {
            return Err(StorageError::InvalidMagic {
                expected: FILE_MAGIC,
                found: bytes[0..8].to_vec(),
            });
        }

        if crc32fast::hash(&bytes[0..16]) != read_u32(bytes, 16) {
            return Err(StorageError::ChecksumMismatch {
                context: "file header CRC mismatch".to_string(),
            });
        }

        let format_version = read_u32(bytes, 8);
        if format_version != FORMAT_VERSION {
            return Err(StorageError::InvalidVersion {
                expected: FORMAT_VERSION,
                found: format_version,
            });
        }

        Ok(Self {
            format_version,
            geometry: TreeGeometry {
                bits_per_level: bytes[12],
                height: bytes[13],
            },
        })
    }

    /// Fails with [`StorageError::GeometryMismatch`] unless the file was
    /// created for `expected`.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn check_geometry(&self, expected: TreeGeometry) -> Result<(), StorageError> {
        if self.geometry == expected {
            Ok(())
        } else {
            Err(StorageError::GeometryMismatch {
                expected_bits: expected.bits_per_level,
                expected_height: expected.height,
                found_bits: self.geometry.bits_per_level,
                found_height: self.geometry.height,
            })
        }
    }
}

// =============================================================================
// Superblock
// =============================================================================

/// Pointer to the committed transaction.
///
/// # Binary Layout (56 bytes)
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -----
/// 0       4     magic ("PWSB")
/// 4       8     generation (u64 LE)
/// 12      8     committed_txn_offset (u64 LE)
/// 20      32    committed_txn_hash (SHA256 of the TxnCommit record)
/// 52      4     crc32 (over bytes 0..52)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Monotonically increasing generation number.
    pub generation: u64,
    /// Byte offset of the TxnCommit record.
    pub committed_txn_offset: u64,
    /// SHA256 hash of the TxnCommit record bytes.
    pub committed_txn_hash: [u8; HASH_SIZE],
}

impl Superblock {
    /// Creates a new superblock.
    #[must_use]
    pub const fn new(
        generation: u64,
        committed_txn_offset: u64,
        committed_txn_hash: [u8; HASH_SIZE],
    ) -> Self {
        Self {
            generation,
            committed_txn_offset,
            committed_txn_hash,
        }
    }

    /// Encodes the superblock to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; SUPERBLOCK_SIZE as usize] {
        let mut buf = [0u8; SUPERBLOCK_SIZE as usize];
        buf[0..4].copy_from_slice(SUPERBLOCK_MAGIC);
        buf[4..12].copy_from_slice(&self.generation.to_le_bytes());
        buf[12..20].copy_from_slice(&self.committed_txn_offset.to_le_bytes());
        buf[20..52].copy_from_slice(&self.committed_txn_hash);
        let crc = crc32fast::hash(&buf[0..52]);
        buf[52..56].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Checks magic and CRC.
    #[must_use]
    pub fn is_valid(bytes: &[u8]) -> bool {
        bytes.len() >= SUPERBLOCK_SIZE as usize
            && &bytes[0..4] == SUPERBLOCK_MAGIC
            && crc32fast::hash(&bytes[0..52]) == read_u32(bytes, 52)
    }

    /// Decodes a superblock, returning `None` if it is torn or blank.
    #[must_use]
    pub fn try_decode(bytes: &[u8]) -> Option<Self> {
        if !Self::is_valid(bytes) {
            return None;
        }
        let mut committed_txn_hash = [0u8; HASH_SIZE];
        committed_txn_hash.copy_from_slice(&bytes[20..52]);
        Some(Self {
            generation: read_u64(bytes, 4),
            committed_txn_offset: read_u64(bytes, 12),
            committed_txn_hash,
        })
    }
}

/// Which superblock slot is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperblockSlot {
    /// Superblock A (first slot).
    A,
    /// Superblock B (second slot).
    B,
}

impl SuperblockSlot {
    /// Returns the other slot.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    /// Returns the byte offset for this slot.
    #[must_use]
    pub const fn offset(self) -> u64 {
        match self {
            Self::A => SUPERBLOCK_A_OFFSET,
            Self::B => SUPERBLOCK_B_OFFSET,
        }
    }
}

/// Selects the valid superblock with the highest generation.
#[must_use]
pub const fn select_active_superblock(
    sb_a: Option<Superblock>,
    sb_b: Option<Superblock>,
) -> Option<(Superblock, SuperblockSlot)> {
    match (sb_a, sb_b) {
        (Some(a), Some(b)) => {
            if a.generation >= b.generation {
                Some((a, SuperblockSlot::A))
            } else {
                Some((b, SuperblockSlot::B))
            }
        }
        (Some(a), None) => Some((a, SuperblockSlot::A)),
        (None, Some(b)) => Some((b, SuperblockSlot::B)),
        (None, None) => None,
    }
}
