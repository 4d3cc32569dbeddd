// SPDX-License-Identifier: MIT

//! Cross-process path locks.
//!
//! Each store path `<p>` is guarded by an exclusive `flock()` on
//! `<lock root>/<p>.lock`, so concurrent scheduler processes (and the
//! garbage collector) coordinate without shared in-process state.
//! Acquisition is non-blocking; callers poll with a configurable
//! interval instead of parking a thread per contended lock.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use cadenza_store_core::StorePath;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

/// An exclusive lock on one path, released on drop.
pub struct PathLock {
    _flock: Flock<File>,
    lock_path: PathBuf,
}

impl PathLock {
    /// `Ok(None)` if another process holds the lock.
    fn try_acquire(lock_path: PathBuf) -> io::Result<Option<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(PathLock {
                _flock: flock,
                lock_path,
            })),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(io::Error::other(format!(
                "flock on {} failed: {errno}",
                lock_path.display()
            ))),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

/// A set of locks acquired together; all-or-nothing.
pub struct PathLocks {
    locks: Vec<PathLock>,
}

impl PathLocks {
    /// Attempts to lock every path in one go. If any lock is contended,
    /// everything acquired so far is released and `Ok(None)` is
    /// returned. Lock files are created under `lock_root`.
    ///
    /// The actual `flock()` calls run on the blocking pool.
    pub async fn try_lock(
        lock_root: &Path,
        paths: impl IntoIterator<Item = &StorePath>,
    ) -> io::Result<Option<PathLocks>> {
        let mut lock_paths: Vec<PathBuf> = paths
            .into_iter()
            .map(|p| lock_root.join(format!("{p}.lock")))
            .collect();
        // deterministic order prevents lock-order inversion between
        // processes locking overlapping sets
        lock_paths.sort();
        lock_paths.dedup();
        let result = tokio::task::spawn_blocking(move || {
            let mut locks = Vec::with_capacity(lock_paths.len());
            for lock_path in lock_paths {
                let lock_name = lock_path.display().to_string();
                match PathLock::try_acquire(lock_path)? {
                    Some(lock) => locks.push(lock),
                    None => {
                        debug!(path = %lock_name, "lock contended, backing off");
                        return Ok(None);
                    }
                }
            }
            Ok(Some(PathLocks { locks }))
        })
        .await
        .map_err(|e| io::Error::other(format!("lock task failed: {e}")))?;
        result
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn path(s: &str) -> StorePath {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn lock_creates_lock_file() {
        let dir = TempDir::new().unwrap();
        let a = path("00000000000000000000000000000000-a");
        let locks = PathLocks::try_lock(dir.path(), [&a]).await.unwrap().unwrap();
        assert_eq!(locks.len(), 1);
        assert!(dir.path().join(format!("{a}.lock")).exists());
    }

    #[tokio::test]
    async fn contended_lock_returns_none() {
        let dir = TempDir::new().unwrap();
        let a = path("00000000000000000000000000000000-a");
        let held = PathLocks::try_lock(dir.path(), [&a]).await.unwrap().unwrap();
        assert!(PathLocks::try_lock(dir.path(), [&a]).await.unwrap().is_none());
        drop(held);
        assert!(PathLocks::try_lock(dir.path(), [&a]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn partial_contention_releases_everything() {
        let dir = TempDir::new().unwrap();
        let a = path("00000000000000000000000000000000-a");
        let b = path("11111111111111111111111111111111-b");
        let _held_b = PathLocks::try_lock(dir.path(), [&b]).await.unwrap().unwrap();
        // a+b fails because b is held, and must not leave a locked behind
        assert!(
            PathLocks::try_lock(dir.path(), [&a, &b])
                .await
                .unwrap()
                .is_none()
        );
        assert!(PathLocks::try_lock(dir.path(), [&a]).await.unwrap().is_some());
    }
}
