//! File-backed implementations of the platform traits.
//!
//! # Atomic Write Pattern
//!
//! [`FsBlobStore`] writes follow this sequence:
//!
//! 1. Write data to a temporary file in the same directory
//! 2. Call `fsync()` on the temporary file
//! 3. Atomically rename the temporary file to the target name
//! 4. Sync the parent directory (Unix only)
//!
//! [`FsLeafFileStore`] does no internal cross-process locking; the manager
//! holds a [`StorageLock`](crate::storage::StorageLock) on the tree directory.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::storage::{StorageError, StorageResult};

use super::{AtomicBlobStore, LeafFileStore};

// =============================================================================
// FsLeafFileStore
// =============================================================================

/// Random-access leaf container backed by a regular file.
#[derive(Debug)]
pub struct FsLeafFileStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl FsLeafFileStore {
    /// Opens the file at `path`, creating it (and its parent directory) if it
    /// does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created or opened.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                StorageError::io(format!("creating leaf directory '{}'", parent.display()), e)
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StorageError::io(format!("opening leaf file '{}'", path.display()), e))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Returns the path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self) -> StorageResult<MutexGuard<'_, File>> {
        self.file
            .lock()
            .map_err(|_| StorageError::lock("leaf file mutex poisoned"))
    }
}

impl LeafFileStore for FsLeafFileStore {
    fn len(&self) -> StorageResult<u64> {
        let file = self.file()?;
        let metadata = file
            .metadata()
            .map_err(|e| StorageError::io("reading leaf file metadata", e))?;
        Ok(metadata.len())
    }

    fn read_at(&self, offset: u64, len: u32) -> StorageResult<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = self.file()?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StorageError::io(format!("seeking to offset {offset}"), e))?;

        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)
            .map_err(|e| StorageError::io(format!("reading {len} bytes at offset {offset}"), e))?;
        Ok(buf)
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        let mut file = self.file()?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StorageError::io(format!("seeking to offset {offset}"), e))?;
        file.write_all(bytes).map_err(|e| {
            StorageError::io(format!("writing {} bytes at offset {offset}", bytes.len()), e)
        })
    }

    fn append(&self, bytes: &[u8]) -> StorageResult<u64> {
        let mut file = self.file()?;
        let offset = file
            .seek(SeekFrom::End(0))
            .map_err(|e| StorageError::io("seeking to end of leaf file", e))?;
        file.write_all(bytes)
            .map_err(|e| StorageError::io(format!("appending {} bytes", bytes.len()), e))?;
        Ok(offset)
    }

    fn sync(&self) -> StorageResult<()> {
        self.file()?
            .sync_all()
            .map_err(|e| StorageError::io("syncing leaf file", e))
    }

    fn set_len(&self, len: u64) -> StorageResult<()> {
        self.file()?
            .set_len(len)
            .map_err(|e| StorageError::io(format!("setting leaf file length to {len}"), e))
    }
}

// =============================================================================
// FsBlobStore
// =============================================================================

/// Directory of small files written with temp-file + rename.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    directory: PathBuf,
}

impl FsBlobStore {
    /// Creates a blob store rooted at `directory`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(directory: impl AsRef<Path>) -> StorageResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory).map_err(|e| {
            StorageError::io(
                format!("creating blob store directory '{}'", directory.display()),
                e,
            )
        })?;
        Ok(Self { directory })
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!(".{name}.tmp"))
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> StorageResult<()> {
        File::open(&self.directory)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| {
                StorageError::io(format!("syncing directory '{}'", self.directory.display()), e)
            })
    }

    #[cfg(not(unix))]
    #[allow(clippy::unnecessary_wraps, clippy::unused_self)]
    fn sync_directory(&self) -> StorageResult<()> {
        Ok(())
    }
}

impl AtomicBlobStore for FsBlobStore {
    fn read(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.blob_path(name);
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(format!("reading blob '{}'", path.display()), e)),
        }
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> StorageResult<()> {
        let final_path = self.blob_path(name);
        let temp_path = self.temp_path(name);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| {
                StorageError::io(format!("creating temporary file '{}'", temp_path.display()), e)
            })?;
        file.write_all(bytes).map_err(|e| {
            StorageError::io(format!("writing temporary file '{}'", temp_path.display()), e)
        })?;
        file.sync_all()
            .map_err(|e| StorageError::io("syncing temporary file", e))?;
        drop(file);

        fs::rename(&temp_path, &final_path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            StorageError::io(
                format!(
                    "renaming '{}' to '{}'",
                    temp_path.display(),
                    final_path.display()
                ),
                e,
            )
        })?;

        self.sync_directory()
    }

    fn delete(&self, name: &str) -> StorageResult<()> {
        let path = self.blob_path(name);
        match fs::remove_file(&path) {
            Ok(()) => self.sync_directory(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(format!("deleting blob '{}'", path.display()), e)),
        }
    }

    fn exists(&self, name: &str) -> StorageResult<bool> {
        Ok(self.blob_path(name).exists())
    }
}
