//! Atomic blob store trait for small file operations.

use crate::storage::StorageResult;

/// Atomic storage for small files such as `hash_cache.cbor` and the software
/// backend's `state.cbor`.
///
/// Implementations MUST use the write-to-temp-then-rename pattern so that a
/// reader sees either the complete old content or the complete new content.
pub trait AtomicBlobStore: Send + Sync {
    /// Reads a blob by name. Returns `Ok(None)` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    fn read(&self, name: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Atomically writes a blob, replacing any existing content.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn write_atomic(&self, name: &str, bytes: &[u8]) -> StorageResult<()>;

    /// Deletes a blob. Deleting a missing blob is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error for actual I/O failures.
    fn delete(&self, name: &str) -> StorageResult<()>;

    /// Checks if a blob exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying read fails.
    fn exists(&self, name: &str) -> StorageResult<bool> {
        Ok(self.read(name)?.is_some())
    }
}
