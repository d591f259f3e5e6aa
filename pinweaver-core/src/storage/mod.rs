//! Storage plumbing shared by the leaf store, the hash tree and the software
//! backend: platform traits, the directory lock and path layout.

mod error;
mod lock;
mod paths;
pub mod platform;

use std::sync::Arc;

pub use error::{StorageError, StorageResult};
pub use lock::{StorageLock, StorageLockGuard};
pub use paths::{StoragePaths, BACKEND_STATE_BLOB, HASH_CACHE_BLOB};
pub use platform::{
    AtomicBlobStore, FsBlobStore, FsLeafFileStore, LeafFileStore, MemoryBlobStore,
    MemoryLeafFileStore,
};

/// Everything the manager needs to open its credential tree.
///
/// Built either from a directory ([`TreeStorage::open_dir`], which also takes
/// the exclusive directory lock) or from caller-supplied stores.
pub struct TreeStorage {
    pub(crate) leaf_store: Arc<dyn LeafFileStore>,
    pub(crate) cache_store: Arc<dyn AtomicBlobStore>,
    pub(crate) lock: Option<StorageLockGuard>,
}

impl TreeStorage {
    /// Wraps caller-provided stores. No directory lock is taken.
    #[must_use]
    pub fn new(leaf_store: Arc<dyn LeafFileStore>, cache_store: Arc<dyn AtomicBlobStore>) -> Self {
        Self {
            leaf_store,
            cache_store,
            lock: None,
        }
    }

    /// Fresh in-memory storage.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryLeafFileStore::new()),
            Arc::new(MemoryBlobStore::new()),
        )
    }

    /// Opens the tree directory under `paths`, taking the exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AlreadyLocked`] if another manager owns the
    /// directory, or an I/O error if the files cannot be opened.
    pub fn open_dir(paths: &StoragePaths) -> StorageResult<Self> {
        let lock = StorageLock::acquire(&paths.lock_path())?;
        let leaf_store = FsLeafFileStore::open(paths.leaf_file_path())?;
        let cache_store = FsBlobStore::new(paths.tree_dir())?;
        Ok(Self {
            leaf_store: Arc::new(leaf_store),
            cache_store: Arc::new(cache_store),
            lock: Some(lock),
        })
    }

    /// Returns `true` if this storage holds the directory lock.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.lock.is_some()
    }
}

impl std::fmt::Debug for TreeStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeStorage")
            .field("locked", &self.lock.is_some())
            .finish_non_exhaustive()
    }
}
