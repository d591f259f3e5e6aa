//! In-memory implementations of the platform traits.
//!
//! These back the test suite and hosts that do not want the manager to touch
//! the filesystem. `MemoryLeafFileStore` can also simulate a failing disk,
//! which is how the lock-on-persistence-failure path is exercised.

#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::storage::{StorageError, StorageResult};

use super::{AtomicBlobStore, LeafFileStore};

fn read_guard<T>(lock: &RwLock<T>) -> StorageResult<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|e| StorageError::lock(format!("memory store poisoned: {e}")))
}

fn write_guard<T>(lock: &RwLock<T>) -> StorageResult<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|e| StorageError::lock(format!("memory store poisoned: {e}")))
}

// =============================================================================
// Memory Blob Store
// =============================================================================

/// In-memory atomic blob store backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryBlobStore {
    /// Creates a new empty memory blob store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the names of all stored blobs.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn list(&self) -> StorageResult<Vec<String>> {
        Ok(read_guard(&self.blobs)?.keys().cloned().collect())
    }

    /// Makes every subsequent write or delete fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StorageError::io(
                "writing blob",
                std::io::Error::other("simulated write failure"),
            ))
        } else {
            Ok(())
        }
    }
}

impl AtomicBlobStore for MemoryBlobStore {
    fn read(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(read_guard(&self.blobs)?.get(name).cloned())
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> StorageResult<()> {
        self.check_writable()?;
        write_guard(&self.blobs)?.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, name: &str) -> StorageResult<()> {
        self.check_writable()?;
        write_guard(&self.blobs)?.remove(name);
        Ok(())
    }

    fn exists(&self, name: &str) -> StorageResult<bool> {
        Ok(read_guard(&self.blobs)?.contains_key(name))
    }
}

// =============================================================================
// Memory Leaf File Store
// =============================================================================

/// In-memory leaf file store backed by a `Vec<u8>`.
#[derive(Debug, Default)]
pub struct MemoryLeafFileStore {
    data: RwLock<Vec<u8>>,
    sync_count: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemoryLeafFileStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding a copy of previously captured file contents.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            ..Self::default()
        }
    }

    /// Returns a copy of the current file contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn snapshot(&self) -> StorageResult<Vec<u8>> {
        Ok(read_guard(&self.data)?.clone())
    }

    /// Returns the number of times `sync()` has succeeded.
    #[must_use]
    pub fn sync_count(&self) -> u64 {
        self.sync_count.load(Ordering::SeqCst)
    }

    /// Makes every subsequent mutating call fail with an I/O error until
    /// cleared again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self, op: &str) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::io(
                format!("memory leaf store {op}"),
                std::io::Error::other("simulated write failure"),
            ));
        }
        Ok(())
    }
}

impl LeafFileStore for MemoryLeafFileStore {
    fn len(&self) -> StorageResult<u64> {
        Ok(read_guard(&self.data)?.len() as u64)
    }

    fn read_at(&self, offset: u64, len: u32) -> StorageResult<Vec<u8>> {
        let data = read_guard(&self.data)?;
        let start = offset as usize;
        let end = start + len as usize;

        if end > data.len() {
            return Err(StorageError::io(
                format!(
                    "read beyond EOF: offset={offset}, len={len}, file_len={}",
                    data.len()
                ),
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "read beyond EOF"),
            ));
        }

        Ok(data[start..end].to_vec())
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        self.check_writable("write_at")?;
        let mut data = write_guard(&self.data)?;
        let start = offset as usize;
        let end = start + bytes.len();

        if end > data.len() {
            data.resize(end, 0);
        }

        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn append(&self, bytes: &[u8]) -> StorageResult<u64> {
        self.check_writable("append")?;
        let mut data = write_guard(&self.data)?;
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn sync(&self) -> StorageResult<()> {
        self.check_writable("sync")?;
        self.sync_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_len(&self, len: u64) -> StorageResult<()> {
        self.check_writable("set_len")?;
        write_guard(&self.data)?.resize(len as usize, 0);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
