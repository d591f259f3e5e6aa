//! Error types for the on-disk storage layer.
//!
//! These errors are raised by the platform traits, the leaf store container
//! and the storage lock. The manager folds them into
//! [`PinWeaverError`](crate::PinWeaverError).

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by storage primitives.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O operation failed.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Context describing the operation.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Invalid magic bytes in a header or record.
    #[error("invalid magic bytes: expected {expected:?}, found {found:?}")]
    InvalidMagic {
        /// Expected magic bytes.
        expected: &'static [u8],
        /// Actual bytes found.
        found: Vec<u8>,
    },

    /// Unsupported format version.
    #[error("invalid format version: expected {expected}, found {found}")]
    InvalidVersion {
        /// Expected version.
        expected: u32,
        /// Actual version found.
        found: u32,
    },

    /// Checksum validation failed.
    #[error("checksum mismatch: {context}")]
    ChecksumMismatch {
        /// Context describing what was being validated.
        context: String,
    },

    /// Data is corrupted or malformed.
    #[error("corrupted data: {context}")]
    CorruptedData {
        /// Description of the corruption.
        context: String,
    },

    /// Unexpected end of data while parsing.
    #[error("unexpected end of data: {context}")]
    UnexpectedEof {
        /// Context describing what was being parsed.
        context: String,
    },

    /// A leaf record is older than the version the index points at.
    #[error("stale leaf record for label {label}: index has version {expected}, record has {found}")]
    StaleLeaf {
        /// Label of the leaf.
        label: u64,
        /// Version recorded in the committed index.
        expected: u64,
        /// Version found in the record.
        found: u64,
    },

    /// The leaf file was created for a different tree shape.
    #[error(
        "tree geometry mismatch: expected {expected_bits} bits/level x {expected_height}, \
         found {found_bits} bits/level x {found_height}"
    )]
    GeometryMismatch {
        /// Configured bits per level.
        expected_bits: u8,
        /// Configured height.
        expected_height: u8,
        /// Bits per level recorded in the file.
        found_bits: u8,
        /// Height recorded in the file.
        found_height: u8,
    },

    /// No valid superblock found in the leaf file.
    #[error("no valid superblock found in leaf file")]
    NoValidSuperblock,

    /// Leaf file is not initialized.
    #[error("leaf file is not initialized")]
    NotInitialized,

    /// Storage directory is locked by another process.
    #[error("storage is locked by another process")]
    AlreadyLocked,

    /// Failed to acquire or release a lock.
    #[error("lock error: {message}")]
    Lock {
        /// Error message.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {message}")]
    Serialization {
        /// Error message.
        message: String,
    },

    /// An internal error occurred.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the error.
        message: String,
    },
}

impl StorageError {
    /// Creates an I/O error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates a corrupted data error.
    pub fn corrupted(context: impl Into<String>) -> Self {
        Self::CorruptedData {
            context: context.into(),
        }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a lock error.
    pub fn lock(message: impl Into<String>) -> Self {
        Self::Lock {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if the error indicates damaged on-disk data rather than
    /// an environmental failure.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::InvalidMagic { .. }
                | Self::InvalidVersion { .. }
                | Self::ChecksumMismatch { .. }
                | Self::CorruptedData { .. }
                | Self::UnexpectedEof { .. }
                | Self::StaleLeaf { .. }
                | Self::NoValidSuperblock
        )
    }
}
