//! Exclusive ownership of a tree directory.
//!
//! The tree directory belongs to one manager for the lifetime of the process.
//! Ownership is enforced with an advisory file lock on `tree/lock`:
//! `flock` on Unix, `LockFileEx` on Windows. The lock is released when the
//! [`StorageLockGuard`] is dropped or the process exits.

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use super::error::{StorageError, StorageResult};

/// A file-backed advisory lock.
#[derive(Debug, Clone)]
pub struct StorageLock {
    file: Arc<File>,
}

/// Guard that holds the exclusive lock for its lifetime.
#[derive(Debug)]
pub struct StorageLockGuard {
    file: Arc<File>,
}

impl StorageLock {
    /// Opens or creates the lock file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| lock_err(&err))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|err| lock_err(&err))?;
        Ok(Self {
            file: Arc::new(file),
        })
    }

    /// Blocks until the exclusive lock is acquired.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be acquired.
    pub fn lock(&self) -> StorageResult<StorageLockGuard> {
        sys::lock_exclusive(&self.file).map_err(|err| lock_err(&err))?;
        Ok(self.guard())
    }

    /// Attempts to acquire the exclusive lock without blocking.
    ///
    /// Returns `Ok(None)` if another holder owns it.
    ///
    /// # Errors
    ///
    /// Returns an error if the attempt fails for any other reason.
    pub fn try_lock(&self) -> StorageResult<Option<StorageLockGuard>> {
        if sys::try_lock_exclusive(&self.file).map_err(|err| lock_err(&err))? {
            Ok(Some(self.guard()))
        } else {
            Ok(None)
        }
    }

    /// Opens the lock file and takes the lock, failing fast with
    /// [`StorageError::AlreadyLocked`] if another manager owns the directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held elsewhere or cannot be taken.
    pub fn acquire(path: &Path) -> StorageResult<StorageLockGuard> {
        Self::open(path)?
            .try_lock()?
            .ok_or(StorageError::AlreadyLocked)
    }

    fn guard(&self) -> StorageLockGuard {
        StorageLockGuard {
            file: Arc::clone(&self.file),
        }
    }
}

impl Drop for StorageLockGuard {
    fn drop(&mut self) {
        let _ = sys::unlock(&self.file);
    }
}

fn lock_err(err: &std::io::Error) -> StorageError {
    StorageError::lock(err.to_string())
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::os::raw::c_int;
    use std::os::unix::io::AsRawFd;

    const LOCK_EX: c_int = 2;
    const LOCK_NB: c_int = 4;
    const LOCK_UN: c_int = 8;

    extern "C" {
        fn flock(fd: c_int, operation: c_int) -> c_int;
    }

    fn call(file: &File, operation: c_int) -> std::io::Result<()> {
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let result = unsafe { flock(file.as_raw_fd(), operation) };
        if result == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    pub fn lock_exclusive(file: &File) -> std::io::Result<()> {
        call(file, LOCK_EX)
    }

    pub fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
        match call(file, LOCK_EX | LOCK_NB) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn unlock(file: &File) -> std::io::Result<()> {
        call(file, LOCK_UN)
    }
}

#[cfg(windows)]
mod sys {
    use std::fs::File;
    use std::os::windows::io::AsRawHandle;

    type Handle = *mut std::ffi::c_void;

    #[repr(C)]
    #[allow(dead_code)]
    struct Overlapped {
        internal: usize,
        internal_high: usize,
        offset: u32,
        offset_high: u32,
        h_event: Handle,
    }

    const LOCKFILE_EXCLUSIVE_LOCK: u32 = 0x2;
    const LOCKFILE_FAIL_IMMEDIATELY: u32 = 0x1;
    const ERROR_LOCK_VIOLATION: i32 = 33;

    extern "system" {
        fn LockFileEx(
            h_file: Handle,
            flags: u32,
            reserved: u32,
            bytes_to_lock_low: u32,
            bytes_to_lock_high: u32,
            overlapped: *mut Overlapped,
        ) -> i32;
        fn UnlockFileEx(
            h_file: Handle,
            reserved: u32,
            bytes_to_unlock_low: u32,
            bytes_to_unlock_high: u32,
            overlapped: *mut Overlapped,
        ) -> i32;
    }

    fn lock_file(file: &File, flags: u32) -> std::io::Result<()> {
        let handle = file.as_raw_handle() as Handle;
        // SAFETY: OVERLAPPED is plain data; the handle is owned by `file`.
        let mut overlapped: Overlapped = unsafe { std::mem::zeroed() };
        let result =
            unsafe { LockFileEx(handle, LOCKFILE_EXCLUSIVE_LOCK | flags, 0, 1, 0, &mut overlapped) };
        if result != 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    pub fn lock_exclusive(file: &File) -> std::io::Result<()> {
        lock_file(file, 0)
    }

    pub fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
        match lock_file(file, LOCKFILE_FAIL_IMMEDIATELY) {
            Ok(()) => Ok(true),
            Err(err) if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn unlock(file: &File) -> std::io::Result<()> {
        let handle = file.as_raw_handle() as Handle;
        // SAFETY: see `lock_file`.
        let mut overlapped: Overlapped = unsafe { std::mem::zeroed() };
        if unsafe { UnlockFileEx(handle, 0, 1, 0, &mut overlapped) } != 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}
