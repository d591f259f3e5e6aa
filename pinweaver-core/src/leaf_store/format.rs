//! File format constants and layout definitions for `leaves.pwstore`.

// Layout comments describe binary structure, not Rust identifiers
#![allow(clippy::doc_markdown)]

/// Magic bytes at the start of every leaf file.
pub const FILE_MAGIC: &[u8; 8] = b"PWLEAVES";

/// Magic bytes for superblock records.
pub const SUPERBLOCK_MAGIC: &[u8; 4] = b"PWSB";

/// Magic bytes for record envelopes in the data region.
pub const RECORD_MAGIC: &[u8; 4] = b"PWRC";

/// Current leaf file format version.
pub const FORMAT_VERSION: u32 = 1;

/// Current record envelope version.
pub const RECORD_VERSION: u16 = 1;

/// Record type for transaction begin marker.
pub const RECORD_TYPE_TXN_BEGIN: u16 = 0x0001;

/// Record type for transaction commit marker.
pub const RECORD_TYPE_TXN_COMMIT: u16 = 0x0002;

/// Record type for the label index snapshot.
pub const RECORD_TYPE_INDEX_SNAPSHOT: u16 = 0x0003;

/// Record type for one leaf's metadata and MAC.
pub const RECORD_TYPE_LEAF: u16 = 0x0004;

/// Leaf flag: metadata was never confirmed by the backend.
pub const LEAF_FLAG_METADATA_LOST: u8 = 0x01;

/// Size of the file header in bytes.
/// Layout: magic(8) + version(4) + bits_per_level(1) + height(1) + reserved(2) + crc(4) = 20
pub const FILE_HEADER_SIZE: u64 = 20;

/// Size of a superblock in bytes.
/// Layout: magic(4) + generation(8) + offset(8) + hash(32) + crc(4) = 56
pub const SUPERBLOCK_SIZE: u64 = 56;

/// Byte offset of superblock A from start of file.
pub const SUPERBLOCK_A_OFFSET: u64 = FILE_HEADER_SIZE;

/// Byte offset of superblock B from start of file.
pub const SUPERBLOCK_B_OFFSET: u64 = FILE_HEADER_SIZE + SUPERBLOCK_SIZE;

/// Byte offset where the data region begins.
pub const DATA_REGION_START: u64 = SUPERBLOCK_B_OFFSET + SUPERBLOCK_SIZE;

/// Size of the record envelope header (excluding body).
/// Layout: magic(4) + type(2) + version(2) + len(4) + crc(4) = 16
pub const RECORD_ENVELOPE_HEADER_SIZE: usize = 16;

/// Size of SHA-256 hash output in bytes.
pub const HASH_SIZE: usize = 32;
