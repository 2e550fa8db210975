//! Cross-process advisory file locks.
//!
//! Uses `flock(2)` through `fs2`. The kernel drops the lock when the
//! holder's descriptor closes, including when the holder dies, so a
//! crashed process can never wedge the lock.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;

use crate::error::TimeoutTarget;
use crate::ExecutorError;

/// A named lock file with bounded acquisition.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    retries: u32,
    interval: Duration,
}

/// Held lock; released on drop.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(lock = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}

impl FileLock {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, retries: u32, interval: Duration) -> Self {
        Self { path: path.into(), retries, interval }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File, ExecutorError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new().create(true).truncate(false).write(true).open(&self.path)?)
    }

    /// Acquires the lock, polling every `interval` for up to `retries`
    /// extra attempts.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Timeout`] with [`TimeoutTarget::Lock`] if
    /// the lock stays held, or an I/O error if the file cannot be opened.
    pub async fn acquire(&self) -> Result<LockGuard, ExecutorError> {
        let file = self.open()?;
        for attempt in 0..=self.retries {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    tracing::debug!(lock = %self.path.display(), attempt, "lock acquired");
                    return Ok(LockGuard { file, path: self.path.clone() });
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    tokio::time::sleep(self.interval).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        let name = self
            .path
            .file_name()
            .map_or_else(|| self.path.display().to_string(), |n| n.to_string_lossy().into_owned());
        Err(ExecutorError::timeout(TimeoutTarget::Lock, name, self.interval * self.retries.saturating_add(1)))
    }
}
