//! Per-day advisory file locks shared between processes
//!
//! Each day file has a sidecar `YYYYMMDD.lock`. Writers hold it exclusively
//! from open to commit; readers take it shared on a best-effort basis and
//! carry on unlocked rather than wait on a crashed writer.

use crate::storage::error::{SpdbError, SpdbResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// A held (or, for degraded reads, absent) lock on one day
#[derive(Debug)]
pub struct DayLock {
    path: PathBuf,
    file: Option<File>,
}

impl DayLock {
    /// Take the exclusive lock, retrying every `retry` until `timeout`
    pub fn exclusive(path: &Path, timeout: Duration, retry: Duration) -> SpdbResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if acquire(&file, timeout, retry, <File as FileExt>::try_lock_exclusive)? {
            tracing::debug!("Locked {:?} for writing", path);
            Ok(Self {
                path: path.to_path_buf(),
                file: Some(file),
            })
        } else {
            Err(SpdbError::LockTimeout {
                path: path.to_path_buf(),
                waited: timeout,
            })
        }
    }

    /// Take the shared lock if possible within `timeout`.
    ///
    /// Never fails: if the lock file cannot be opened or the lock is not
    /// granted in time, a warning is logged and the returned lock is not held.
    pub fn shared(path: &Path, timeout: Duration, retry: Duration) -> Self {
        let file = match open_for_shared(path) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("Cannot open lock file {:?} ({}), reading unlocked", path, e);
                return Self::unlocked(path);
            }
        };

        match acquire(&file, timeout, retry, <File as FileExt>::try_lock_shared) {
            Ok(true) => Self {
                path: path.to_path_buf(),
                file: Some(file),
            },
            Ok(false) => {
                tracing::warn!(
                    "No read lock on {:?} after {:?}, reading unlocked",
                    path,
                    timeout
                );
                Self::unlocked(path)
            }
            Err(e) => {
                tracing::warn!("Read lock on {:?} failed ({}), reading unlocked", path, e);
                Self::unlocked(path)
            }
        }
    }

    /// A placeholder for reads that skip locking altogether
    pub fn unlocked(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            file: None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DayLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = <File as FileExt>::unlock(&file) {
                tracing::warn!("Failed to release lock {:?}: {}", self.path, e);
            }
        }
    }
}

fn open_for_shared(path: &Path) -> io::Result<File> {
    match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
    {
        Ok(file) => Ok(file),
        // Read-only media: an existing lock file can still be locked shared
        Err(_) => File::open(path),
    }
}

/// Poll `try_lock` until it succeeds or `timeout` passes. `Ok(false)` means timed out.
fn acquire(
    file: &File,
    timeout: Duration,
    retry: Duration,
    try_lock: fn(&File) -> io::Result<()>,
) -> io::Result<bool> {
    let start = Instant::now();
    loop {
        match try_lock(file) {
            Ok(()) => return Ok(true),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                if start.elapsed() >= timeout {
                    return Ok(false);
                }
                std::thread::sleep(retry.min(timeout.saturating_sub(start.elapsed())));
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const RETRY: Duration = Duration::from_millis(5);

    #[test]
    fn test_exclusive_lock_times_out_while_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("20240101.lock");

        let held = DayLock::exclusive(&path, Duration::from_millis(100), RETRY).unwrap();
        assert!(held.is_held());

        let err = DayLock::exclusive(&path, Duration::from_millis(30), RETRY).unwrap_err();
        assert!(matches!(err, SpdbError::LockTimeout { .. }));
        assert!(err.is_retryable());

        drop(held);
        assert!(DayLock::exclusive(&path, Duration::from_millis(30), RETRY).is_ok());
    }

    #[test]
    fn test_readers_share() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("20240101.lock");

        let a = DayLock::shared(&path, Duration::from_millis(30), RETRY);
        let b = DayLock::shared(&path, Duration::from_millis(30), RETRY);
        assert!(a.is_held());
        assert!(b.is_held());
    }

    #[test]
    fn test_reader_degrades_when_writer_holds_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("20240101.lock");

        let _writer = DayLock::exclusive(&path, Duration::from_millis(100), RETRY).unwrap();
        let reader = DayLock::shared(&path, Duration::from_millis(20), RETRY);
        assert!(!reader.is_held());
    }
}
