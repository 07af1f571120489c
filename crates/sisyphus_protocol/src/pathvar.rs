//! `Path` and `Variable`: typed handles to files a job creates
//! (`spec.md §3`, §4.B).

use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path as StdPath, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sisyphus_hash::{Fingerprint, HashCtx, HashError};
use thiserror::Error;

use crate::markers::{path_in, FINISHED_RUN, OUTPUT_DIR};
use crate::role::ProcessRole;
use crate::sisyphus_id::SisyphusId;

/// Where a `Path`'s underlying file lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    /// A location relative to its creator job's `output/` directory.
    /// Requires `creator` to be `Some`.
    Relative(String),
    /// An absolute, externally-supplied filesystem location (e.g. a raw
    /// corpus file with no creator job).
    Absolute(PathBuf),
}

/// A typed handle to a file output, with a creator back-reference and an
/// availability predicate (`spec.md §4.B`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    creator: Option<SisyphusId>,
    location: Location,
    /// Overrides the Hasher's fingerprint with a caller-supplied digest
    /// string, for Paths whose content identity should be pinned
    /// independent of their location (`spec.md §3`).
    hash_overwrite: Option<String>,
}

#[derive(Debug, Error)]
pub enum PathError {
    #[error("Path has no absolute location and no work directory context was given")]
    NoWorkDirContext,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Path {
    pub fn relative(creator: SisyphusId, relative: impl Into<String>) -> Self {
        Self {
            creator: Some(creator),
            location: Location::Relative(relative.into()),
            hash_overwrite: None,
        }
    }

    pub fn absolute(path: impl Into<PathBuf>) -> Self {
        Self {
            creator: None,
            location: Location::Absolute(path.into()),
            hash_overwrite: None,
        }
    }

    pub fn with_hash_overwrite(mut self, digest: impl Into<String>) -> Self {
        self.hash_overwrite = Some(digest.into());
        self
    }

    pub fn creator(&self) -> Option<&SisyphusId> {
        self.creator.as_ref()
    }

    /// Resolve the absolute on-disk location of this Path's file.
    pub fn resolve(&self, work_dir: &StdPath) -> Result<PathBuf, PathError> {
        match &self.location {
            Location::Absolute(p) => Ok(p.clone()),
            Location::Relative(rel) => {
                let creator = self.creator.as_ref().ok_or(PathError::NoWorkDirContext)?;
                Ok(creator.work_dir(work_dir).join(OUTPUT_DIR).join(rel))
            }
        }
    }

    /// True iff the underlying file is present on disk.
    pub fn exists(&self, work_dir: &StdPath) -> bool {
        self.resolve(work_dir)
            .map(|p| p.exists())
            .unwrap_or(false)
    }

    /// `spec.md §4.B`: true iff `exists()` AND (no creator OR creator is
    /// finished). Finished-ness of the creator is determined by the
    /// presence of `finished.run` in the creator's work directory — the
    /// same marker the manager itself treats as authoritative.
    pub fn available(&self, work_dir: &StdPath) -> bool {
        if !self.exists(work_dir) {
            return false;
        }
        match &self.creator {
            None => true,
            Some(creator) => path_in(&creator.work_dir(work_dir), FINISHED_RUN).exists(),
        }
    }
}

impl Fingerprint for Path {
    fn fingerprint(&self, ctx: &mut HashCtx) -> Result<sisyphus_hash::Digest, HashError> {
        if let Some(overwrite) = &self.hash_overwrite {
            return Ok(sisyphus_hash::opaque(overwrite.as_bytes()));
        }
        // `spec.md §3`: fingerprint is
        // `(creator.sisyphus_id OR absolute_path_bytes, relative_location, hash_overwrite)`.
        let creator_digest = match &self.creator {
            Some(id) => id.to_string().fingerprint(ctx)?,
            None => match &self.location {
                Location::Absolute(p) => {
                    sisyphus_hash::opaque(p.to_string_lossy().as_bytes())
                }
                Location::Relative(_) => {
                    return Err(HashError::NotHashable {
                        type_name: "Path",
                        reason: "relative location with no creator".to_string(),
                    })
                }
            },
        };
        let location_digest = match &self.location {
            Location::Relative(rel) => rel.fingerprint(ctx)?,
            Location::Absolute(_) => sisyphus_hash::opaque(b""),
        };
        let overwrite_digest: Option<sisyphus_hash::Digest> = None;
        Ok(sisyphus_hash::record(
            "Path",
            &[
                ("creator_or_absolute", creator_digest),
                ("location", location_digest),
                (
                    "hash_overwrite",
                    overwrite_digest.unwrap_or_else(|| sisyphus_hash::opaque(b"")),
                ),
            ],
        ))
    }
}

/// A `Path` whose on-disk payload is a serialized value of type `T`.
/// `get`/`set` are only permitted from within a worker
/// (`ProcessRole::Worker`): reading/writing from the manager would
/// linearize computation onto the scheduling loop (`spec.md §4.B`).
#[derive(Debug, Clone)]
pub struct Variable<T> {
    path: Path,
    _marker: PhantomData<T>,
}

#[derive(Debug, Error)]
pub enum VariableError {
    #[error("Variable::{operation} is forbidden outside a worker process (current role: {role:?})")]
    WrongRole {
        operation: &'static str,
        role: Option<ProcessRole>,
    },
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl<T> Variable<T> {
    pub fn new(path: Path) -> Self {
        Self {
            path,
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self, work_dir: &StdPath) -> bool {
        self.path.exists(work_dir)
    }

    pub fn available(&self, work_dir: &StdPath) -> bool {
        self.path.available(work_dir)
    }

    fn require_worker_role(operation: &'static str) -> Result<(), VariableError> {
        let role = ProcessRole::current();
        if role == Some(ProcessRole::Worker) {
            Ok(())
        } else {
            Err(VariableError::WrongRole { operation, role })
        }
    }
}

impl<T: DeserializeOwned> Variable<T> {
    pub fn get(&self, work_dir: &StdPath) -> Result<T, VariableError> {
        Self::require_worker_role("get")?;
        let resolved = self.path.resolve(work_dir)?;
        let bytes = fs::read(&resolved)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl<T: Serialize> Variable<T> {
    /// Atomically write `value` via a temp file + rename, so a reader never
    /// observes a partially-written payload (`spec.md §4.B`).
    pub fn set(&self, work_dir: &StdPath, value: &T) -> Result<(), VariableError> {
        Self::require_worker_role("set")?;
        let resolved = self.path.resolve(work_dir)?;
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = resolved.with_extension("tmp-write");
        fs::write(&tmp, serde_json::to_vec(value)?)?;
        fs::rename(&tmp, &resolved)?;
        Ok(())
    }
}
