//! Advisory file locks.
//!
//! Thin wrapper over `flock(2)`. Locks are per open file description, so
//! they serialize both separate processes and separate handles inside one
//! process. The lock is released when the [`FileLock`] is dropped.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use apptainer_core::error::{ApptainerError, Result};

/// An exclusive advisory lock on a file.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Open (creating if needed) `path` and block until an exclusive lock is held.
    pub fn exclusive(path: &Path) -> Result<Self> {
        let file = open_lock_file(path)?;
        Self::lock(file, path)
    }

    /// Like [`FileLock::exclusive`] but returns `None` if another holder exists.
    pub fn try_exclusive(path: &Path) -> Result<Option<Self>> {
        let file = open_lock_file(path)?;
        match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.raw_os_error() == Some(libc::EWOULDBLOCK) => Ok(None),
            Err(e) => Err(lock_error(path, e)),
        }
    }

    /// Take an exclusive lock on an already opened file.
    pub fn lock(file: File, path: &Path) -> Result<Self> {
        flock(&file, libc::LOCK_EX).map_err(|e| lock_error(path, e))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The locked file handle.
    pub fn file(&self) -> &File {
        &self.file
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = flock(&self.file, libc::LOCK_UN) {
            tracing::debug!(path = %self.path.display(), error = %e, "Failed to release lock");
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| lock_error(path, e))
}

fn flock(file: &File, operation: libc::c_int) -> std::io::Result<()> {
    loop {
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let ret = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if ret == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn lock_error(path: &Path, e: std::io::Error) -> ApptainerError {
    ApptainerError::IoError(std::io::Error::new(
        e.kind(),
        format!("failed to lock {}: {}", path.display(), e),
    ))
}
