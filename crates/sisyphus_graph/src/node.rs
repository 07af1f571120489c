//! Type-erased view over a `Job<A>`, so the Graph can hold jobs of
//! differing argument types in one canonicalization table (`spec.md §4.D`).

use std::path::{Path as StdPath, PathBuf};

use sisyphus_job::{ErrorCause, Job, JobArgs, JobError, ResourceRequirements, Task, TaskError};
use sisyphus_protocol::{Path, SisyphusId};

/// Everything the Graph (and, downstream, the manager and worker) needs to
/// know about a job without knowing its concrete argument type.
pub trait JobNode: Send + Sync {
    fn id(&self) -> &SisyphusId;
    fn tasks(&self) -> &[Task];
    fn escalation_factor(&self) -> f64;
    fn escalation_cap(&self) -> u32;
    fn input_paths(&self) -> Vec<Path>;
    fn run_task(&self, task_name: &str, shard: u32) -> Result<(), TaskError>;

    /// Write `job.save` under this job's work directory (`spec.md §4.F`
    /// dispatch phase step 1: "materialize its work directory ...
    /// serialize the job"). Delegates to [`Job::save`], which every
    /// concrete `Job<A>` gets for free since `A: Serialize`.
    fn save(&self, job_dir: &StdPath) -> Result<(), JobError>;

    /// Escalated resource requirements for a retryable failure of
    /// `task_idx`, or `None` once the escalation cap is reached (`spec.md
    /// §4.C`).
    fn escalated_resources(
        &self,
        task_idx: usize,
        cause: ErrorCause,
        prior_retry_count: u32,
    ) -> Option<ResourceRequirements>;

    fn work_dir(&self, work_dir_root: &StdPath) -> PathBuf {
        self.id().work_dir(work_dir_root)
    }
}

impl<A> JobNode for Job<A>
where
    A: JobArgs + Send + Sync,
{
    fn id(&self) -> &SisyphusId {
        Job::id(self)
    }

    fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    fn escalation_factor(&self) -> f64 {
        self.escalation_factor
    }

    fn escalation_cap(&self) -> u32 {
        self.escalation_cap
    }

    fn input_paths(&self) -> Vec<Path> {
        Job::input_paths(self)
    }

    fn run_task(&self, task_name: &str, shard: u32) -> Result<(), TaskError> {
        Job::run_task(self, task_name, shard)
    }

    fn save(&self, job_dir: &StdPath) -> Result<(), JobError> {
        Job::save(self, job_dir)
    }

    fn escalated_resources(
        &self,
        task_idx: usize,
        cause: ErrorCause,
        prior_retry_count: u32,
    ) -> Option<ResourceRequirements> {
        Job::escalated_resources(self, task_idx, cause, prior_retry_count)
    }
}
