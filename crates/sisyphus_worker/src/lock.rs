//! Exclusive file locking scoped to `(task, shard)`, so at most one worker
//! process ever runs a given shard at a time (`spec.md §4.G` step 1).
//!
//! Uses the `fs2` crate for cross-platform file locking, the same pattern
//! the rest of the system uses for its on-disk coordination (`spec.md §5`:
//! "all coordination goes through atomic file creation ... and exclusive
//! file locks").

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use sisyphus_protocol::markers::TaskShard;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("shard {0} is already locked by another worker")]
    Busy(String),
    #[error("failed to create lock file: {0}")]
    CreateFailed(#[source] io::Error),
    #[error("failed to acquire lock: {0}")]
    AcquireFailed(#[source] io::Error),
}

/// Holds the exclusive lock until dropped; the lock file itself is left
/// behind (fs2 unlocks on close, and the next worker just reopens it).
pub struct ShardLockGuard {
    _file: File,
    lock_path: PathBuf,
}

impl ShardLockGuard {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

fn lock_path_for(job_dir: &Path, shard: TaskShard<'_>) -> PathBuf {
    job_dir.join(format!(".lock.{}.{}", shard.task, shard.shard))
}

/// Try to acquire the exclusive lock for `shard` under `job_dir`. Non-blocking:
/// if another worker already holds it, returns `Err(LockError::Busy)`
/// immediately, matching the "exit busy, not an error" contract.
pub fn try_lock_shard(job_dir: &Path, shard: TaskShard<'_>) -> Result<ShardLockGuard, LockError> {
    let lock_path = lock_path_for(job_dir, shard);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(LockError::CreateFailed)?;

    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => Ok(ShardLockGuard {
            _file: file,
            lock_path,
        }),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            Err(LockError::Busy(format!("{}.{}", shard.task, shard.shard)))
        }
        Err(e) => Err(LockError::AcquireFailed(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn first_lock_succeeds_second_is_busy() {
        let dir = tempdir().unwrap();
        let shard = TaskShard::new("run", 0);
        let guard = try_lock_shard(dir.path(), shard).unwrap();
        let err = try_lock_shard(dir.path(), shard).unwrap_err();
        assert!(matches!(err, LockError::Busy(_)));
        drop(guard);
        assert!(try_lock_shard(dir.path(), shard).is_ok());
    }

    #[test]
    fn different_shards_lock_independently() {
        let dir = tempdir().unwrap();
        let _a = try_lock_shard(dir.path(), TaskShard::new("run", 0)).unwrap();
        let _b = try_lock_shard(dir.path(), TaskShard::new("run", 1)).unwrap();
    }
}
