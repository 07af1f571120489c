//! The one-shot subprocess contract an Engine invokes as
//! `worker <job_dir> <task> [shard]` (`spec.md §4.G`).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sisyphus_job::{classify_error_body, JobInfo};
use sisyphus_protocol::markers::{self, TaskShard};
use sysinfo::{Pid, System};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::lock::{self, LockError};
use crate::registry::{RegistryError, TaskRegistry};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Exit-code-bearing outcome of [`run`] (`spec.md §6`: 0 success, 1
/// unrecoverable error, 2 bad usage, 3 worker busy).
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("shard busy: {0}")]
    Busy(#[from] LockError),
    #[error("no job.save found under {0}")]
    MissingJobSave(PathBuf),
    #[error("job.save under {0} has no readable class_name")]
    MalformedJobSave(PathBuf),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("task '{0}' failed: {1}")]
    TaskFailed(String, String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerError::Busy(_) => 3,
            _ => 1,
        }
    }
}

/// Run `task_name`/`shard` under `job_dir`, following the full worker
/// contract: lock, start marker, load, run, heartbeat, finish/error marker.
pub fn run(
    job_dir: &Path,
    task_name: &str,
    shard: u32,
    registry: &TaskRegistry,
) -> Result<(), WorkerError> {
    let shard_ref = TaskShard::new(task_name, shard);

    // 1. Exclusive lock scoped to (task, shard). Busy is not an error.
    let _lock = lock::try_lock_shard(job_dir, shard_ref)?;

    // 2. log.<task>.<shard>: start timestamp and host.
    write_start_marker(job_dir, shard_ref)?;

    // 3. Deserialize the job from job.save.
    let class_name = peek_class_name(job_dir)?;
    let node = registry.load(&class_name, job_dir)?;

    // A prior error marker for this exact shard means this invocation is a
    // retry; a `continuable` task resumes via its `resume_function_name`
    // instead of restarting from `function_name` (`spec.md §4.C`
    // "continuable", DESIGN.md's pinned semantics for it).
    let is_retry = markers::path_in(job_dir, &markers::error_marker(shard_ref)).exists();
    let entry_point = node
        .tasks()
        .iter()
        .find(|t| t.function_name == task_name)
        .map(|t| t.entry_point(is_retry).to_string())
        .unwrap_or_else(|| task_name.to_string());

    // SIGTERM handling: write an interrupted error marker and exit before
    // the engine's follow-up SIGKILL lands.
    let interrupted = install_sigterm_handler(job_dir, shard_ref);

    // 5. Heartbeat resource usage into `info` while the task runs.
    let stop_heartbeat = Arc::new(AtomicBool::new(false));
    let heartbeat_handle = spawn_heartbeat(job_dir.to_path_buf(), stop_heartbeat.clone());

    // 4. Run the named task function with the shard index. The marker
    // vocabulary stays keyed by `task_name` regardless of which function
    // actually ran, so a later retry still finds the same shard markers.
    let result = node.run_task(&entry_point, shard);

    stop_heartbeat.store(true, Ordering::SeqCst);
    let _ = heartbeat_handle.join();

    if interrupted.load(Ordering::SeqCst) {
        // The signal handler already wrote the interrupted marker.
        return Err(WorkerError::TaskFailed(
            task_name.to_string(),
            "interrupted by signal".to_string(),
        ));
    }

    match result {
        Ok(()) => {
            // A successful retry leaves a stale `error.*` behind, which
            // would otherwise read as a finished/errored contradiction
            // (`spec.md §3`: "inconsistent-markers"). Clear it first.
            let error_path = markers::path_in(job_dir, &markers::error_marker(shard_ref));
            if error_path.exists() {
                fs::remove_file(&error_path)?;
            }
            // 6. Atomically mark this shard finished.
            write_marker_atomic(job_dir, &markers::finished_marker(shard_ref), "")?;
            info!(job_dir = %job_dir.display(), task = task_name, shard, "shard finished");
            Ok(())
        }
        Err(err) => {
            // 7. Classify and record the failure.
            let body = format!("{err}");
            write_marker_atomic(job_dir, &markers::error_marker(shard_ref), &body)?;
            warn!(job_dir = %job_dir.display(), task = task_name, shard, cause = %classify_error_body(&body).is_transient(), "shard errored");
            Err(WorkerError::TaskFailed(task_name.to_string(), body))
        }
    }
}

fn write_start_marker(job_dir: &Path, shard: TaskShard<'_>) -> std::io::Result<()> {
    let host = System::host_name().unwrap_or_else(|| "unknown".to_string());
    let body = format!("started_at={}\nhost={}\n", Utc::now().to_rfc3339(), host);
    write_marker_atomic(job_dir, &markers::log_marker(shard), &body)
}

/// Atomic marker write: tempfile + rename (`spec.md §5`).
fn write_marker_atomic(job_dir: &Path, marker: &str, body: &str) -> std::io::Result<()> {
    let path = markers::path_in(job_dir, marker);
    let tmp = path.with_extension("tmp-write");
    fs::write(&tmp, body)?;
    fs::rename(&tmp, &path)
}

fn peek_class_name(job_dir: &Path) -> Result<String, WorkerError> {
    let path = markers::path_in(job_dir, markers::JOB_SAVE);
    if !path.exists() {
        return Err(WorkerError::MissingJobSave(job_dir.to_path_buf()));
    }
    let bytes = fs::read(&path)?;
    let value: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|_| WorkerError::MalformedJobSave(job_dir.to_path_buf()))?;
    value
        .get("class_name")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| WorkerError::MalformedJobSave(job_dir.to_path_buf()))
}

fn spawn_heartbeat(job_dir: PathBuf, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let pid = Pid::from_u32(std::process::id());
        let mut system = System::new();
        while !stop.load(Ordering::SeqCst) {
            std::thread::sleep(HEARTBEAT_INTERVAL);
            if stop.load(Ordering::SeqCst) {
                break;
            }
            system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
            let (rss_mb, cpu_percent) = match system.process(pid) {
                Some(proc) => (
                    Some(proc.memory() as f64 / 1_000_000.0),
                    Some(proc.cpu_usage() as f64),
                ),
                None => (None, None),
            };
            match JobInfo::load(&job_dir) {
                Ok(mut info) => {
                    info.record_heartbeat(rss_mb, cpu_percent, Utc::now());
                    if let Err(err) = info.save(&job_dir) {
                        warn!(job_dir = %job_dir.display(), error = %err, "failed to save heartbeat");
                    }
                }
                Err(err) => warn!(job_dir = %job_dir.display(), error = %err, "failed to load info for heartbeat"),
            }
        }
    })
}

#[cfg(unix)]
fn install_sigterm_handler(job_dir: &Path, shard: TaskShard<'_>) -> Arc<AtomicBool> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let job_dir = job_dir.to_path_buf();
    let task_name = shard.task.to_string();
    let shard_idx = shard.shard;
    let flag = interrupted.clone();
    if let Ok(mut signals) = signal_hook::iterator::Signals::new([signal_hook::consts::SIGTERM]) {
        std::thread::spawn(move || {
            if signals.forever().next().is_some() {
                flag.store(true, Ordering::SeqCst);
                let body = format!("SIGTERM: interrupted by engine at {}", Utc::now().to_rfc3339());
                let shard = TaskShard::new(&task_name, shard_idx);
                if let Err(err) = write_marker_atomic(&job_dir, &markers::error_marker(shard), &body) {
                    error!(job_dir = %job_dir.display(), error = %err, "failed to write interrupted marker");
                }
            }
        });
    }
    interrupted
}

#[cfg(not(unix))]
fn install_sigterm_handler(job_dir: &Path, shard: TaskShard<'_>) -> Arc<AtomicBool> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let job_dir = job_dir.to_path_buf();
    let task_name = shard.task.to_string();
    let shard_idx = shard.shard;
    let flag = interrupted.clone();
    let result = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
        let body = format!("CTRL_BREAK: interrupted by engine at {}", Utc::now().to_rfc3339());
        let shard = TaskShard::new(&task_name, shard_idx);
        if let Err(err) = write_marker_atomic(&job_dir, &markers::error_marker(shard), &body) {
            error!(job_dir = %job_dir.display(), error = %err, "failed to write interrupted marker");
        }
    });
    if let Err(err) = result {
        error!(error = %err, "failed to install ctrl handler");
    }
    interrupted
}

#[cfg(test)]
mod tests {
    use super::*;
    use sisyphus_hash::{Digest, HashCtx, HashError};
    use sisyphus_job::{Job, JobArgs, Task, TaskError};
    use tempfile::tempdir;

    #[derive(Clone, serde::Serialize, serde::Deserialize)]
    struct OkArgs {
        n: u64,
    }

    impl JobArgs for OkArgs {
        fn kept_fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError> {
            sisyphus_hash::Fingerprint::fingerprint(&self.n, ctx)
        }

        fn run_task(&self, task_name: &str, _shard: u32) -> Result<(), TaskError> {
            match task_name {
                "run" => Ok(()),
                other => Err(TaskError::UnknownTask(other.to_string())),
            }
        }
    }

    #[derive(Clone, serde::Serialize, serde::Deserialize)]
    struct FailArgs;

    impl JobArgs for FailArgs {
        fn kept_fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError> {
            sisyphus_hash::Fingerprint::fingerprint(&0u8, ctx)
        }

        fn run_task(&self, _task_name: &str, _shard: u32) -> Result<(), TaskError> {
            Err(TaskError::UserCode("boom".to_string()))
        }
    }

    #[test]
    fn successful_task_writes_finished_marker() {
        let dir = tempdir().unwrap();
        let job = Job::new("recipes", "Ok", OkArgs { n: 1 }, vec![Task::new("run")]).unwrap();
        job.save(dir.path()).unwrap();

        let mut registry = TaskRegistry::new();
        registry.register::<OkArgs>("Ok");

        run(dir.path(), "run", 0, &registry).unwrap();
        assert!(dir.path().join(markers::finished_marker(TaskShard::new("run", 0))).exists());
    }

    #[test]
    fn failing_task_writes_error_marker() {
        let dir = tempdir().unwrap();
        let job = Job::new("recipes", "Fail", FailArgs, vec![Task::new("run")]).unwrap();
        job.save(dir.path()).unwrap();

        let mut registry = TaskRegistry::new();
        registry.register::<FailArgs>("Fail");

        let err = run(dir.path(), "run", 0, &registry).unwrap_err();
        assert!(matches!(err, WorkerError::TaskFailed(_, _)));
        assert!(dir.path().join(markers::error_marker(TaskShard::new("run", 0))).exists());
    }

    #[test]
    fn concurrent_run_on_same_shard_is_busy() {
        let dir = tempdir().unwrap();
        let job = Job::new("recipes", "Ok", OkArgs { n: 1 }, vec![Task::new("run")]).unwrap();
        job.save(dir.path()).unwrap();

        let _held = lock::try_lock_shard(dir.path(), TaskShard::new("run", 0)).unwrap();

        let mut registry = TaskRegistry::new();
        registry.register::<OkArgs>("Ok");

        let err = run(dir.path(), "run", 0, &registry).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
