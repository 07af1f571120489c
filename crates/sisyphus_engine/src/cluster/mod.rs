//! Cluster engines: translate requirements to backend flags, shell out to
//! submission binaries, and parse queue state via backend query commands
//! (`spec.md §4.E`). SGE, Slurm and LSF differ only in their binaries,
//! flags, and output formats, so they share one generic [`ClusterEngine`]
//! driven by a small per-backend [`ClusterBackend`] — the same
//! one-trait-many-backends split the teacher uses for parser execution
//! (`Runner` / `DevRunner` / `QueuedRunner`).

pub mod lsf;
pub mod sge;
pub mod slurm;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use sisyphus_job::ResourceRequirements;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::engine::{Engine, EngineError, EngineTaskState, QueueSnapshot, TaskRef};

/// What's different between SGE, Slurm, and LSF: how to build the
/// submission/query/kill command lines and how to parse their output.
/// Everything else (caching, bookkeeping, the `Engine` impl) is shared.
pub trait ClusterBackend: Send + Sync {
    /// `qsub`/`sbatch`/`bsub`, with flags translated from `resources`.
    fn submit_command(&self, task: &TaskRef, resources: &ResourceRequirements, worker_binary: &std::path::Path) -> Command;

    /// Extract this backend's external job id from the submission
    /// command's stdout.
    fn parse_submit_output(&self, stdout: &str) -> Result<String, EngineError>;

    /// `qstat`/`squeue`/`bjobs`.
    fn query_command(&self) -> Command;

    /// Map external job id -> observed state, from the query command's
    /// stdout.
    fn parse_query_output(&self, stdout: &str) -> HashMap<String, EngineTaskState>;

    /// `qdel`/`scancel`/`bkill`.
    fn kill_command(&self, external_id: &str) -> Command;

    fn name(&self) -> &'static str;
}

/// Build a `Command` for `program args...`, tunneled through `gateway` via
/// `ssh` when one is configured (`spec.md §4.E`: "optionally tunnel through
/// a gateway host"). Submission binaries like `qsub`/`sbatch`/`bsub` are
/// often only present on a cluster head node the manager can't log into
/// directly.
pub(crate) fn build_command(gateway: Option<&str>, program: &str, args: &[String]) -> Command {
    match gateway {
        Some(host) => {
            let mut cmd = Command::new("ssh");
            cmd.arg(host).arg(program).args(args);
            cmd
        }
        None => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
    }
}

struct TaskRecord {
    external_id: String,
    state: EngineTaskState,
}

struct ClusterEngineState {
    tasks: HashMap<TaskRef, TaskRecord>,
    cached_snapshot: Option<QueueSnapshot>,
}

/// Shared plumbing for every cluster backend: submit shells out and
/// remembers the external id, `queue_state` runs the query command once
/// per tick and caches the parsed result, `kill` shells out by external id.
pub struct ClusterEngine<B: ClusterBackend> {
    backend: B,
    worker_binary: PathBuf,
    state: Mutex<ClusterEngineState>,
}

impl<B: ClusterBackend> ClusterEngine<B> {
    pub fn new(backend: B, worker_binary: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            worker_binary: worker_binary.into(),
            state: Mutex::new(ClusterEngineState {
                tasks: HashMap::new(),
                cached_snapshot: None,
            }),
        }
    }
}

#[async_trait]
impl<B: ClusterBackend> Engine for ClusterEngine<B> {
    async fn submit_task(
        &self,
        task: &TaskRef,
        resources: &ResourceRequirements,
    ) -> Result<(), EngineError> {
        let mut cmd = self.backend.submit_command(task, resources, &self.worker_binary);
        let output = cmd
            .output()
            .await
            .map_err(|e| EngineError::Unreachable(e.to_string()))?;
        if !output.status.success() {
            return Err(EngineError::SubmissionFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let external_id = self.backend.parse_submit_output(&stdout)?;
        debug!(backend = self.backend.name(), external_id, job_dir = %task.job_dir.display(), "submitted to cluster");

        let mut state = self.state.lock().unwrap();
        state.tasks.insert(
            task.clone(),
            TaskRecord {
                external_id,
                state: EngineTaskState::Queued,
            },
        );
        state.cached_snapshot = None;
        Ok(())
    }

    async fn queue_state(&self) -> Result<QueueSnapshot, EngineError> {
        {
            let state = self.state.lock().unwrap();
            if let Some(snapshot) = &state.cached_snapshot {
                return Ok(snapshot.clone());
            }
        }

        let mut cmd = self.backend.query_command();
        let output = cmd
            .output()
            .await
            .map_err(|e| EngineError::Unreachable(e.to_string()))?;
        if !output.status.success() {
            warn!(backend = self.backend.name(), "queue query failed; treating as transient");
            return Ok(self.state.lock().unwrap().tasks.iter().map(|(k, v)| (k.clone(), v.state)).collect());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let by_external_id = self.backend.parse_query_output(&stdout);

        let mut state = self.state.lock().unwrap();
        for record in state.tasks.values_mut() {
            record.state = by_external_id
                .get(&record.external_id)
                .copied()
                .unwrap_or(EngineTaskState::Unknown);
        }
        let snapshot: QueueSnapshot = state.tasks.iter().map(|(k, v)| (k.clone(), v.state)).collect();
        state.cached_snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn task_state(&self, task: &TaskRef) -> Result<EngineTaskState, EngineError> {
        let snapshot = self.queue_state().await?;
        Ok(snapshot.get(task).copied().unwrap_or(EngineTaskState::Unknown))
    }

    async fn kill(&self, task: &TaskRef) -> Result<(), EngineError> {
        let external_id = {
            let state = self.state.lock().unwrap();
            state.tasks.get(task).map(|r| r.external_id.clone())
        };
        let Some(external_id) = external_id else {
            return Ok(());
        };
        let mut cmd = self.backend.kill_command(&external_id);
        let _ = cmd.output().await;
        Ok(())
    }

    async fn reset_cache(&self) {
        self.state.lock().unwrap().cached_snapshot = None;
    }
}
