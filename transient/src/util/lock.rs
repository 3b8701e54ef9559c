//! Advisory exclusive file lock with timeout and scoped release.
//!
//! Gates two things in this codebase: retrieval-and-promote into the
//! backend store (`.working/<name>`) and all state-mutating VM operations
//! (`<vmdir>/config`).

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};

use crate::error::{TransientError, TransientResult};

/// A held advisory lock. The lock is released when this value is dropped
/// (the file descriptor closes on every exit path: normal return, error
/// propagation via `?`, or process exit).
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Acquire an exclusive lock on `path`, creating the file if needed.
///
/// Attempts a non-blocking lock; on contention, sleeps `interval` and
/// retries. If `timeout` is `None`, blocks indefinitely. Otherwise, once
/// the timeout has elapsed since the first attempt, returns
/// [`TransientError::LockHeldElsewhere`].
pub fn lock(path: &Path, timeout: Option<Duration>, interval: Duration) -> TransientResult<FileLock> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).write(true).open(path)?;
    let started = Instant::now();

    loop {
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {
                return Ok(FileLock {
                    _file: file,
                    path: path.to_path_buf(),
                })
            }
            Err(Errno::EWOULDBLOCK) => {
                if let Some(timeout) = timeout {
                    if started.elapsed() >= timeout {
                        return Err(TransientError::LockHeldElsewhere {
                            path: path.to_path_buf(),
                        });
                    }
                }
                std::thread::sleep(interval);
            }
            Err(errno) => return Err(TransientError::Io(std::io::Error::from(errno))),
        }
    }
}

/// Try to acquire the lock exactly once, with no retry — used by readers
/// that want to distinguish "free" from "held" without waiting (e.g.
/// `iter_states`).
pub fn try_lock(path: &Path) -> TransientResult<FileLock> {
    lock(path, Some(Duration::ZERO), Duration::from_millis(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn reacquire_after_release_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockfile");

        let guard = lock(&path, Some(Duration::from_secs(1)), Duration::from_millis(10)).unwrap();
        drop(guard);

        let guard2 = lock(&path, Some(Duration::from_secs(1)), Duration::from_millis(10)).unwrap();
        drop(guard2);
    }

    #[test]
    fn contended_lock_times_out_no_earlier_than_requested() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockfile");

        let held = lock(&path, None, Duration::from_millis(10)).unwrap();

        let (tx, rx) = mpsc::channel();
        let path2 = path.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let result = lock(&path2, Some(Duration::from_millis(200)), Duration::from_millis(20));
            tx.send((start.elapsed(), result.is_err())).unwrap();
        });

        let (elapsed, failed) = rx.recv().unwrap();
        handle.join().unwrap();
        drop(held);

        assert!(failed, "second acquisition should fail while first is held");
        assert!(elapsed >= Duration::from_millis(200));
    }
}
