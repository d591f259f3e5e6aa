//! Storage path helpers.

use std::path::{Path, PathBuf};

const TREE_DIRNAME: &str = "tree";
const BACKEND_DIRNAME: &str = "backend";
const LEAF_FILENAME: &str = "leaves.pwstore";
const LOCK_FILENAME: &str = "lock";
const CONFIG_FILENAME: &str = "config.json";

/// Name of the hash cache blob inside the tree directory.
pub const HASH_CACHE_BLOB: &str = "hash_cache.cbor";

/// Name of the software backend state blob inside the backend directory.
pub const BACKEND_STATE_BLOB: &str = "state.cbor";

/// Paths for PinWeaver artifacts under a root directory.
///
/// ```text
/// <root>/
///   config.json
///   tree/leaves.pwstore
///   tree/hash_cache.cbor
///   tree/lock
///   backend/state.cbor
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    /// Builds storage paths rooted at `root`.
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Returns the storage root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory owned by the manager.
    #[must_use]
    pub fn tree_dir(&self) -> PathBuf {
        self.root.join(TREE_DIRNAME)
    }

    /// Returns the path to the leaf container.
    #[must_use]
    pub fn leaf_file_path(&self) -> PathBuf {
        self.tree_dir().join(LEAF_FILENAME)
    }

    /// Returns the path to the lock file.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.tree_dir().join(LOCK_FILENAME)
    }

    /// Returns the directory used by the software backend.
    #[must_use]
    pub fn backend_dir(&self) -> PathBuf {
        self.root.join(BACKEND_DIRNAME)
    }

    /// Returns the path to the optional JSON configuration.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILENAME)
    }
}
