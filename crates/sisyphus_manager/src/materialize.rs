//! Work-directory materialization for a newly-runnable job (`spec.md
//! §4.F` dispatch phase, step 1: "create directory, serialize the job,
//! create predecessor symlinks under `input/`, create `output/` subdir,
//! wire alias symlinks").

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use sisyphus_graph::JobNode;
use sisyphus_protocol::markers::{INPUT_DIR, OUTPUT_DIR};

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

/// Materialize `node`'s work directory under `work_dir` if it doesn't
/// already exist: `job.save`, `output/`, and one `input/<predecessor>`
/// symlink per distinct creator among its declared input paths. Idempotent
/// — safe to call every tick for a job that is already materialized, since
/// a job directory once created is never recreated from scratch (`spec.md
/// §3`: "Monotone completion").
pub fn materialize(node: &dyn JobNode, work_dir: &Path) -> std::io::Result<()> {
    let job_dir = node.work_dir(work_dir);
    fs::create_dir_all(&job_dir)?;
    fs::create_dir_all(job_dir.join(OUTPUT_DIR))?;

    let input_dir = job_dir.join(INPUT_DIR);
    fs::create_dir_all(&input_dir)?;
    let mut seen = HashSet::new();
    for input in node.input_paths() {
        let Some(creator) = input.creator() else {
            continue;
        };
        if !seen.insert(creator.clone()) {
            continue;
        }
        let link_name = creator.dir_name();
        let link_path = input_dir.join(&link_name);
        if link_path.symlink_metadata().is_ok() {
            continue;
        }
        let target = creator.work_dir(work_dir);
        // The predecessor isn't guaranteed to be materialized yet if this
        // is called before its `finished.run` landed; ancestor-before-
        // descendant dispatch ordering (`spec.md §4.F`) means it will be
        // by the time this job is actually submitted, but materialization
        // itself may run slightly ahead.
        if symlink_dir(&target, &link_path).is_err() {
            let _ = fs::remove_file(&link_path);
        }
    }

    node.save(&job_dir)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sisyphus_hash::{Digest, HashCtx, HashError};
    use sisyphus_job::{Job, JobArgs, Task};
    use sisyphus_protocol::Path as SisPath;
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

    #[derive(Clone, serde::Serialize, serde::Deserialize)]
    struct Downstream {
        upstream: SisPath,
    }

    impl JobArgs for Downstream {
        fn kept_fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError> {
            sisyphus_hash::Fingerprint::fingerprint(&self.upstream, ctx)
        }

        fn input_paths(&self) -> Vec<SisPath> {
            vec![self.upstream.clone()]
        }
    }

    #[test]
    fn materialize_creates_output_dir_and_job_save() {
        let dir = tempdir().unwrap();
        let job = Job::new("recipes", "Count", Args { n: 1 }, vec![Task::new("run")]).unwrap();
        materialize(&job, dir.path()).unwrap();

        let job_dir = job.work_dir(dir.path());
        assert!(job_dir.join(OUTPUT_DIR).is_dir());
        assert!(job_dir.join(sisyphus_protocol::markers::JOB_SAVE).is_file());
    }

    #[test]
    fn materialize_links_predecessor_under_input() {
        let dir = tempdir().unwrap();
        let upstream = Job::new("recipes", "Count", Args { n: 1 }, vec![Task::new("run")]).unwrap();
        let upstream_output = upstream.output_path("vocab.txt");
        let downstream = Job::new(
            "recipes",
            "Downstream",
            Downstream {
                upstream: upstream_output,
            },
            vec![Task::new("run")],
        )
        .unwrap();

        materialize(&upstream, dir.path()).unwrap();
        materialize(&downstream, dir.path()).unwrap();

        let input_link = downstream
            .work_dir(dir.path())
            .join(INPUT_DIR)
            .join(upstream.id().dir_name());
        assert!(input_link.symlink_metadata().is_ok());
    }
}
