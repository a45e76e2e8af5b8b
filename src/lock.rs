//! Cross-process run lock.
//!
//! An advisory `flock` on a well-known file. The kernel releases it when the
//! holder exits for any reason, so a lock left behind by a crashed run is
//! simply acquired again; the pid the crashed run wrote is logged.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use fs2::FileExt;
use tracing::{debug, warn};

use crate::errors::{PipelineError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RunLock {
    path: PathBuf,
}

/// Held for the duration of one run. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockHandle {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock, polling until `wait` elapses. A zero `wait`
    /// makes a single attempt.
    pub fn acquire(&self, wait: Duration) -> Result<LockHandle> {
        let io_err = |source| PipelineError::LockIo {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(io_err)?;

        let deadline = Instant::now() + wait;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(e) if is_contended(&e) => {
                    if Instant::now() >= deadline {
                        return Err(PipelineError::Busy {
                            path: self.path.clone(),
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(io_err(e)),
            }
        }

        let mut previous = String::new();
        file.read_to_string(&mut previous).map_err(io_err)?;
        let previous = previous.trim();
        if !previous.is_empty() {
            warn!(path = %self.path.display(), previous_owner = previous, "Reclaimed stale lock");
        }

        file.set_len(0).map_err(io_err)?;
        file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        writeln!(file, "pid={} acquired_at={}", std::process::id(), Utc::now().to_rfc3339())
            .map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        debug!(path = %self.path.display(), "Acquired run lock");
        Ok(LockHandle {
            file,
            path: self.path.clone(),
        })
    }
}

impl RunLock {
    /// [`RunLock::acquire`] on the blocking pool, so a wait never parks a
    /// runtime worker thread.
    pub async fn acquire_async(&self, wait: Duration) -> Result<LockHandle> {
        let lock = self.clone();
        tokio::task::spawn_blocking(move || lock.acquire(wait))
            .await
            .map_err(|e| PipelineError::LockIo {
                path: self.path.clone(),
                source: std::io::Error::other(e),
            })?
    }
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        // An empty file on the next acquire means the previous run exited cleanly.
        if let Err(e) = self.file.set_len(0) {
            warn!(path = %self.path.display(), error = %e, "Failed to clear lock owner");
        }
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release run lock");
        }
        debug!(path = %self.path.display(), "Released run lock");
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::tempdir;

    #[test]
    fn test_second_acquire_is_busy() {
        let dir = tempdir().unwrap();
        let lock = RunLock::new(dir.path().join("gavel.lock"));

        let held = lock.acquire(Duration::ZERO).unwrap();
        let err = lock.acquire(Duration::ZERO).unwrap_err();
        assert!(matches!(err, PipelineError::Busy { .. }));
        drop(held);

        assert!(lock.acquire(Duration::ZERO).is_ok());
    }

    #[test]
    fn test_concurrent_acquires_yield_exactly_one_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gavel.lock");
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let lock = RunLock::new(&path);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let result = lock.acquire(Duration::ZERO);
                    // Hold the winner long enough for the loser to observe it.
                    std::thread::sleep(Duration::from_millis(200));
                    result.map(|_| ())
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let acquired = results.iter().filter(|r| r.is_ok()).count();
        let busy = results
            .iter()
            .filter(|r| matches!(r, Err(PipelineError::Busy { .. })))
            .count();
        assert_eq!((acquired, busy), (1, 1));
    }

    #[test]
    fn test_wait_picks_up_released_lock() {
        let dir = tempdir().unwrap();
        let lock = RunLock::new(dir.path().join("gavel.lock"));
        let held = lock.acquire(Duration::ZERO).unwrap();

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            drop(held);
        });
        let second = lock.acquire(Duration::from_secs(5));
        releaser.join().unwrap();
        assert!(second.is_ok());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_async_wait_lets_the_runtime_release_the_holder() {
        let dir = tempdir().unwrap();
        let lock = RunLock::new(dir.path().join("gavel.lock"));
        let held = lock.acquire(Duration::ZERO).unwrap();

        // The releaser shares the only runtime thread with the waiter.
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            drop(held);
        });
        let second = lock.acquire_async(Duration::from_secs(5)).await;
        releaser.await.unwrap();
        assert!(second.is_ok());
    }

    #[test]
    fn test_handle_records_owner_and_clears_on_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("gavel.lock");
        let lock = RunLock::new(&path);

        let handle = lock.acquire(Duration::ZERO).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(&format!("pid={}", std::process::id())));
        drop(handle);

        assert!(path.exists());
        assert!(std::fs::read_to_string(&path).unwrap().is_empty());
    }

    #[test]
    fn test_leftover_owner_is_reclaimed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gavel.lock");
        std::fs::write(&path, "pid=999999 acquired_at=2025-01-01T00:00:00Z\n").unwrap();

        let handle = RunLock::new(&path).acquire(Duration::ZERO).unwrap();
        let content = std::fs::read_to_string(handle.path()).unwrap();
        assert!(!content.contains("999999"));
    }
}
