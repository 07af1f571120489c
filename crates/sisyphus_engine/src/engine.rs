//! The Engine contract every dispatch backend implements (`spec.md §4.E`).

use std::path::PathBuf;

use async_trait::async_trait;
use sisyphus_job::ResourceRequirements;
use sisyphus_protocol::markers::TaskShard;
use sisyphus_protocol::SisyphusId;
use thiserror::Error;

/// Identifies one shard of one task of one job, the unit an Engine
/// dispatches and tracks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskRef {
    pub job_id: SisyphusId,
    pub job_dir: PathBuf,
    pub task: String,
    pub shard: u32,
}

impl TaskRef {
    pub fn new(job_id: SisyphusId, job_dir: impl Into<PathBuf>, task: impl Into<String>, shard: u32) -> Self {
        Self {
            job_id,
            job_dir: job_dir.into(),
            task: task.into(),
            shard,
        }
    }

    pub fn shard(&self) -> TaskShard<'_> {
        TaskShard::new(&self.task, self.shard)
    }
}

/// An engine's view of a dispatched task, as reported by `queue_state`/
/// `task_state` (`spec.md §4.E`). This is deliberately coarser than
/// [`sisyphus_job::JobState`] — the Engine doesn't read markers, only its
/// own submission bookkeeping; the manager reconciles the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineTaskState {
    Queued,
    Running,
    /// The engine has no record of this task — either it finished and was
    /// reaped, or it was never submitted through this engine instance.
    Unknown,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine unreachable: {0}")]
    Unreachable(String),
    #[error("submission failed: {0}")]
    SubmissionFailed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A consistent snapshot of every task this engine currently has a record
/// of, taken once per manager tick (`spec.md §4.E`, §5: "queue_state
/// observations are tick-consistent").
pub type QueueSnapshot = std::collections::HashMap<TaskRef, EngineTaskState>;

#[async_trait]
pub trait Engine: Send + Sync {
    /// Persist `engine_cmd.*`/`submit_log.*` under `task.job_dir` and hand
    /// the work to this backend, which invokes the `sisyphus` binary it was
    /// constructed with as `worker <job_dir> <task> [shard]`.
    async fn submit_task(
        &self,
        task: &TaskRef,
        resources: &ResourceRequirements,
    ) -> Result<(), EngineError>;

    /// A fresh, or tick-cached, snapshot of every task this engine knows
    /// about. Implementations that cache must invalidate on
    /// [`Engine::reset_cache`].
    async fn queue_state(&self) -> Result<QueueSnapshot, EngineError>;

    async fn task_state(&self, task: &TaskRef) -> Result<EngineTaskState, EngineError>;

    /// Best-effort cancellation; may race with the task completing on its
    /// own.
    async fn kill(&self, task: &TaskRef) -> Result<(), EngineError>;

    /// Invalidate any cached `queue_state` result, so the next call
    /// re-queries the backend. Called once at the start of every manager
    /// tick.
    async fn reset_cache(&self);
}
