//! Advisory single-manager-per-work-directory enforcement (`spec.md §5`:
//! "Only one manager per work directory is supported; enforcement is
//! advisory (a lockfile in the work dir) — concurrent managers lead to
//! undefined behavior and the user is responsible.").
//!
//! This deliberately does not try to be airtight: a crashed manager that
//! never released the lock would otherwise strand every future run, and
//! the spec is explicit that this is advisory, not a correctness
//! mechanism.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockfileError {
    #[error("another manager already holds the lock at {0}")]
    AlreadyLocked(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Holds the advisory manager lock until dropped.
pub struct ManagerLock {
    _file: File,
    path: PathBuf,
}

impl ManagerLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the advisory lock at `path`, creating it if absent. Returns
    /// [`LockfileError::AlreadyLocked`] immediately if another process
    /// holds it — the caller (the manager binary) should treat this as a
    /// startup error, not silently proceed.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockfileError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Self { _file: file, path }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(LockfileError::AlreadyLocked(path))
            }
            Err(e) => Err(LockfileError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_is_rejected_while_first_is_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manager.lock");
        let first = ManagerLock::acquire(&path).unwrap();
        let err = ManagerLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LockfileError::AlreadyLocked(_)));
        drop(first);
        assert!(ManagerLock::acquire(&path).is_ok());
    }
}
