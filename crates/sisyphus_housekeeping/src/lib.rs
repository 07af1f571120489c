//! Orphan job-directory cleanup and output/alias symlink maintenance
//! (`spec.md §4.H`).
//!
//! "Live" is whatever the current [`sisyphus_graph::Graph`] can reach from
//! its interned jobs; everything else under the work directory is an
//! orphan. This crate only ever touches the filesystem through the same
//! atomic-rename and exclusive-lock discipline the rest of the system uses
//! (`spec.md §5`) — a housekeeping bug should never corrupt a live job's
//! markers.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sisyphus_graph::Graph;
use sisyphus_protocol::markers;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Every job directory that currently holds a `job.save` marker, found by
/// walking the work directory. A job directory is never nested inside
/// another job directory, so the walk stops descending once it finds one.
pub fn discover_job_dirs(work_dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut walker = WalkDir::new(work_dir).into_iter();
    while let Some(entry) = walker.next() {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_dir() {
            continue;
        }
        if entry.path().join(markers::JOB_SAVE).is_file() {
            found.push(entry.path().to_path_buf());
            walker.skip_current_dir();
        }
    }
    found
}

/// Job directories reachable from `graph`'s interned jobs.
pub fn live_job_dirs(graph: &Graph, work_dir: &Path) -> HashSet<PathBuf> {
    graph
        .live_jobs()
        .iter()
        .map(|node| node.id().work_dir(work_dir))
        .collect()
}

/// Job directories on disk that the current graph no longer references.
pub fn orphans(graph: &Graph, work_dir: &Path) -> Vec<PathBuf> {
    let live = live_job_dirs(graph, work_dir);
    discover_job_dirs(work_dir)
        .into_iter()
        .filter(|dir| !live.contains(dir))
        .collect()
}

/// An orphan is safe to remove once its `finished.run` marker (if any) is
/// older than `grace_period` — a job that never finished, or finished too
/// recently, might still be the target of an in-flight retry the manager
/// just hasn't observed the drop of yet.
pub fn is_safe_to_remove(job_dir: &Path, grace_period: Duration) -> std::io::Result<bool> {
    let finished_path = job_dir.join(markers::FINISHED_RUN);
    let metadata = match fs::metadata(&finished_path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    let modified = metadata.modified()?;
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    Ok(age >= grace_period)
}

/// Remove every orphan whose `finished.run` is older than `grace_period`.
/// Returns the set actually removed; orphans still within grace are left
/// alone and will be reconsidered next tick.
pub fn remove_orphans(graph: &Graph, work_dir: &Path, grace_period: Duration) -> std::io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for dir in orphans(graph, work_dir) {
        match is_safe_to_remove(&dir, grace_period) {
            Ok(true) => {
                fs::remove_dir_all(&dir)?;
                info!(job_dir = %dir.display(), "removed orphan job directory");
                removed.push(dir);
            }
            Ok(false) => {
                info!(job_dir = %dir.display(), "orphan within grace period, not removing");
            }
            Err(err) => {
                warn!(job_dir = %dir.display(), error = %err, "failed to check orphan safety");
            }
        }
    }
    Ok(removed)
}

/// Remove a named job and every job transitively depending on it — the
/// console's "rerun this subtree" primitive (`spec.md §4.H`). Unlike
/// [`remove_orphans`] this has no grace period: it's an explicit user
/// action, not automatic cleanup.
pub fn remove_subtree(graph: &Graph, root: &sisyphus_protocol::SisyphusId, work_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut ids = graph.descendants(root);
    ids.push(root.clone());

    let mut removed = Vec::new();
    for id in ids {
        let dir = id.work_dir(work_dir);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            info!(job_dir = %dir.display(), "removed job directory (subtree rerun)");
            removed.push(dir);
        }
    }
    Ok(removed)
}

/// Recreate `output/` and `alias/` symlink trees from the current graph, so
/// they stay consistent with the live graph every manager tick (`spec.md
/// §4.H`). Stale entries (names no longer registered) are removed first.
pub fn resync_symlinks(
    graph: &Graph,
    work_dir: &Path,
    output_root: &Path,
    alias_root: &Path,
) -> std::io::Result<()> {
    resync_dir(output_root, graph.outputs().iter().enumerate().map(|(i, path)| {
        let name = path
            .creator()
            .map(|id| id.class_name().to_string())
            .unwrap_or_else(|| format!("output_{i}"));
        (name, path.resolve(work_dir).ok())
    }))?;

    let alias_entries = graph
        .aliases()
        .into_iter()
        .map(|(alias, id)| (alias, Some(id.work_dir(work_dir))));
    resync_dir(alias_root, alias_entries)?;
    Ok(())
}

fn resync_dir(root: &Path, entries: impl Iterator<Item = (String, Option<PathBuf>)>) -> std::io::Result<()> {
    fs::create_dir_all(root)?;
    let mut wanted = HashSet::new();
    for (name, target) in entries {
        let Some(target) = target else { continue };
        wanted.insert(name.clone());
        let link_path = root.join(&name);
        if link_path.symlink_metadata().is_ok() {
            fs::remove_file(&link_path)?;
        }
        symlink(&target, &link_path)?;
    }
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !wanted.contains(&name) {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sisyphus_hash::{Digest, HashCtx, HashError};
    use sisyphus_job::{Job, JobArgs, Task};
    use tempfile::tempdir;

    #[derive(Clone, serde::Serialize, serde::Deserialize)]
    struct Args {
        n: u64,
    }

    impl JobArgs for Args {
        fn kept_fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError> {
            sisyphus_hash::Fingerprint::fingerprint(&self.n, ctx)
        }
    }

    #[test]
    fn orphan_directory_not_in_graph_is_detected() {
        let dir = tempdir().unwrap();
        let work_dir = dir.path();
        let graph = Graph::new();
        let job = Job::new("recipes", "Count", Args { n: 1 }, vec![Task::new("run")]).unwrap();
        let job = graph.intern(job);

        let live_dir = job.work_dir(work_dir);
        fs::create_dir_all(&live_dir).unwrap();
        fs::write(live_dir.join(markers::JOB_SAVE), "{}").unwrap();

        let orphan_dir = work_dir.join("recipes").join("Count.STALE1234");
        fs::create_dir_all(&orphan_dir).unwrap();
        fs::write(orphan_dir.join(markers::JOB_SAVE), "{}").unwrap();

        let found = orphans(&graph, work_dir);
        assert_eq!(found, vec![orphan_dir]);
    }

    #[test]
    fn orphan_within_grace_period_is_not_safe_to_remove() {
        let dir = tempdir().unwrap();
        let job_dir = dir.path().join("job");
        fs::create_dir_all(&job_dir).unwrap();
        fs::write(job_dir.join(markers::FINISHED_RUN), "").unwrap();

        assert!(!is_safe_to_remove(&job_dir, Duration::from_secs(3600)).unwrap());
        assert!(is_safe_to_remove(&job_dir, Duration::from_secs(0)).unwrap());
    }

    #[test]
    fn unfinished_orphan_is_never_safe_to_remove() {
        let dir = tempdir().unwrap();
        let job_dir = dir.path().join("job");
        fs::create_dir_all(&job_dir).unwrap();
        assert!(!is_safe_to_remove(&job_dir, Duration::from_secs(0)).unwrap());
    }
}
