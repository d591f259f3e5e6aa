//! Random-access file trait for the leaf container.

use crate::storage::StorageResult;

/// Random-access file operations for `leaves.pwstore`.
///
/// The container is a single logical file that requires:
/// - Random-access reads (for superblocks and records)
/// - Writes at specific offsets (for superblock updates)
/// - Append operations (for transaction records)
/// - Durability guarantees (sync/fsync)
///
/// # File Structure
///
/// ```text
/// ┌──────────────────────────────────────────┐
/// │            FileHeader (20 bytes)         │  offset 0
/// ├──────────────────────────────────────────┤
/// │           SuperblockA (56 bytes)         │  offset 20
/// ├──────────────────────────────────────────┤
/// │           SuperblockB (56 bytes)         │  offset 76
/// ├──────────────────────────────────────────┤
/// │                                          │
/// │         Data Region (append-only)        │  offset 132+
/// │                                          │
/// │   - TxnBegin records                     │
/// │   - LeafRecord records                   │
/// │   - IndexSnapshot records                │
/// │   - TxnCommit records                    │
/// │                                          │
/// └──────────────────────────────────────────┘
/// ```
///
/// # Durability
///
/// After `sync()` returns, a published superblock and the committed
/// transaction it references MUST survive a crash.
pub trait LeafFileStore: Send + Sync {
    /// Returns the current file length in bytes, or 0 if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file length cannot be determined.
    fn len(&self) -> StorageResult<u64>;

    /// Returns `true` if the file is empty or doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file length cannot be determined.
    fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range extends past the end of the file or
    /// reading fails.
    fn read_at(&self, offset: u64, len: u32) -> StorageResult<Vec<u8>>;

    /// Writes bytes at a specific offset (superblock updates).
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write_at(&self, offset: u64, bytes: &[u8]) -> StorageResult<()>;

    /// Appends bytes to the end of the file and returns the offset they were
    /// written at.
    ///
    /// # Errors
    ///
    /// Returns an error if appending fails.
    fn append(&self, bytes: &[u8]) -> StorageResult<u64>;

    /// Flushes all written data to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&self) -> StorageResult<()>;

    /// Truncates or extends the file to `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be resized.
    fn set_len(&self, len: u64) -> StorageResult<()>;
}
