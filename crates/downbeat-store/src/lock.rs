//! Advisory file locks on sibling `<path>.lock` files.
//!
//! Locks are held via `fs2` exclusive flock on a dedicated lock file, so
//! both processes - and every thread within them - serialize on the same
//! OS-level primitive. Reads use a short deadline, writes a longer one; a
//! lock that cannot be taken within the deadline is an error, never an
//! indefinite hang.

use crate::error::StoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Deadline for read-side lock acquisition.
pub const READ_LOCK_TIMEOUT: Duration = Duration::from_millis(500);
/// Deadline for write-side lock acquisition.
pub const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const RETRY_SLEEP: Duration = Duration::from_millis(25);

/// An advisory lock guarding one shared file.
#[derive(Clone, Debug)]
pub struct FileLock {
    lock_path: PathBuf,
}

/// RAII guard; the flock is released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl FileLock {
    /// Lock object for `<path>.lock` next to the guarded file.
    #[must_use]
    pub fn for_file(guarded: &Path) -> Self {
        let mut lock_path = guarded.as_os_str().to_owned();
        lock_path.push(".lock");
        Self {
            lock_path: PathBuf::from(lock_path),
        }
    }

    /// Path of the lock file itself.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Take the lock for a read, bounded by [`READ_LOCK_TIMEOUT`].
    pub fn acquire_read(&self) -> Result<LockGuard, StoreError> {
        self.acquire(READ_LOCK_TIMEOUT)
    }

    /// Take the lock for a write, bounded by [`WRITE_LOCK_TIMEOUT`].
    pub fn acquire_write(&self) -> Result<LockGuard, StoreError> {
        self.acquire(WRITE_LOCK_TIMEOUT)
    }

    fn acquire(&self, timeout: Duration) -> Result<LockGuard, StoreError> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::io(&self.lock_path, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| StoreError::io(&self.lock_path, e))?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(LockGuard { file }),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(StoreError::LockTimeout(self.lock_path.clone()));
                    }
                    std::thread::sleep(RETRY_SLEEP);
                }
                Err(e) => return Err(StoreError::io(&self.lock_path, e)),
            }
        }
    }
}
