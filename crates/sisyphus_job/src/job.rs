//! The Job type: declared inputs, outputs, computed identity, and retry
//! escalation (`spec.md §3`, §4.C).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sisyphus_hash::{Digest, HashCtx, HashError};
use sisyphus_protocol::{Path, SisyphusId};

use crate::error::TaskError;
use crate::resources::ResourceRequirements;
use crate::state::ErrorCause;
use crate::task::Task;

/// Implemented by a recipe's argument struct. Only the fields a recipe
/// author folds into `kept_fingerprint` contribute to the job's
/// sisyphus-id — fields a recipe explicitly flags as non-hashed
/// (`spec.md §3`: "explicitly excluded by the job definition") are simply
/// left out of the implementation, rather than requiring a separate
/// exclusion list the hasher has to interpret.
pub trait JobArgs: Serialize + for<'de> Deserialize<'de> {
    fn kept_fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError>;

    /// The `Path`/`Variable` handles this job's arguments depend on — the
    /// Graph uses these to derive dependency edges and to build its
    /// reverse (descendant) index (`spec.md §3`: "edges are implied by
    /// each job's input paths"). Jobs with no file-backed dependencies
    /// (pure parameter sweeps) can leave this empty.
    fn input_paths(&self) -> Vec<Path> {
        Vec::new()
    }

    /// Run `task_name` (the worker's "run the named task function with the
    /// shard index as its argument", `spec.md §4.G`). Recipe authors match
    /// on `task_name` against their own `Task::function_name`/
    /// `resume_function_name` strings; anything unrecognized is a
    /// programming error in the recipe, not a task-runtime failure.
    fn run_task(&self, task_name: &str, shard: u32) -> Result<(), TaskError> {
        let _ = shard;
        Err(TaskError::UnknownTask(task_name.to_string()))
    }
}

/// A job: a recipe's declared inputs, its tasks, and the derived identity
/// those inputs produce. Outputs are not stored on `Job` itself — calling
/// [`Job::output_path`] hands back a [`Path`] rooted at this job's
/// identity, and it is the caller's (the Graph's) responsibility to
/// register it as a root (`spec.md §4.D`).
///
/// `Serialize`/`Deserialize` (derived, since every field including `A` is
/// serializable) is what `job.save` is: the worker reconstructs the exact
/// same `Job<A>` rather than recomputing it from recipe code, so a retry
/// sees the identical resource requirements and escalation state the
/// manager wrote (`spec.md §4.G`: "Deserialize the job from `job.save`").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job<A> {
    pub module_path: String,
    pub class_name: String,
    pub args: A,
    pub tasks: Vec<Task>,
    pub escalation_factor: f64,
    pub escalation_cap: u32,
    id: SisyphusId,
}

impl<A: JobArgs> Job<A> {
    /// Compute `sisyphus-id = SHA-256(ClassName, kept_input_arguments)`
    /// (`spec.md §3`): the kept arguments are first folded down to a single
    /// BLAKE3 [`Digest`] via [`JobArgs::kept_fingerprint`] (the Hasher's
    /// canonical, order-independent-where-appropriate encoding), then that
    /// digest's hex text is combined with the class name and run through
    /// the outer SHA-256/base64url used for the identifier itself — see
    /// `sisyphus_hash::sha256_base64url` for why these are deliberately two
    /// different algorithms.
    pub fn new(
        module_path: impl Into<String>,
        class_name: impl Into<String>,
        args: A,
        tasks: Vec<Task>,
    ) -> Result<Self, HashError> {
        let module_path = module_path.into();
        let class_name = class_name.into();
        let mut ctx = HashCtx::new();
        let args_digest = args.kept_fingerprint(&mut ctx)?;
        let canonical = format!("{}\0{}", class_name, args_digest.to_hex());
        let digest_b64 = sisyphus_hash::sha256_base64url(canonical.as_bytes());
        let id = SisyphusId::new(module_path.clone(), class_name.clone(), digest_b64);
        Ok(Self {
            module_path,
            class_name,
            args,
            tasks,
            escalation_factor: sisyphus_protocol::defaults::DEFAULT_ESCALATION_FACTOR,
            escalation_cap: sisyphus_protocol::defaults::DEFAULT_ESCALATION_CAP,
            id,
        })
    }

    pub fn with_escalation(mut self, factor: f64, cap: u32) -> Self {
        self.escalation_factor = factor;
        self.escalation_cap = cap;
        self
    }

    pub fn id(&self) -> &SisyphusId {
        &self.id
    }

    pub fn work_dir(&self, work_dir_root: &std::path::Path) -> PathBuf {
        self.id.work_dir(work_dir_root)
    }

    /// A `Path` rooted at this job, for a file it creates at
    /// `output/<relative>`.
    pub fn output_path(&self, relative: impl Into<String>) -> Path {
        Path::relative(self.id.clone(), relative)
    }

    /// The Paths this job's arguments declare as dependencies — delegates
    /// to [`JobArgs::input_paths`].
    pub fn input_paths(&self) -> Vec<Path> {
        self.args.input_paths()
    }

    /// Run `task_name` for `shard` — delegates to [`JobArgs::run_task`].
    pub fn run_task(&self, task_name: &str, shard: u32) -> Result<(), crate::error::TaskError> {
        self.args.run_task(task_name, shard)
    }

    /// Write `job.save` under this job's work directory, atomically
    /// (tempfile + rename), so a manager crash mid-write never leaves a
    /// worker reading a half-written file.
    pub fn save(&self, job_dir: &std::path::Path) -> Result<(), crate::error::JobError>
    where
        A: serde::Serialize,
    {
        let json = serde_json::to_vec_pretty(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(job_dir)?;
        std::io::Write::write_all(&mut tmp, &json)?;
        tmp.persist(job_dir.join(sisyphus_protocol::markers::JOB_SAVE))
            .map_err(|e| e.error)?;
        Ok(())
    }

    /// Load `job.save` from `job_dir`, reconstructing the exact `Job<A>`
    /// the manager wrote (`spec.md §4.G`).
    pub fn load(job_dir: &std::path::Path) -> Result<Self, crate::error::JobError>
    where
        A: for<'de> serde::Deserialize<'de>,
    {
        let bytes = std::fs::read(job_dir.join(sisyphus_protocol::markers::JOB_SAVE))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Resource requirements for `task_idx`, escalated for a retry if
    /// `cause` is transient and `prior_retry_count` hasn't hit the cap
    /// (`spec.md §4.C`). Returns `None` when the cap has been reached —
    /// callers should then surface the job as permanently errored.
    pub fn escalated_resources(
        &self,
        task_idx: usize,
        cause: ErrorCause,
        prior_retry_count: u32,
    ) -> Option<ResourceRequirements> {
        if prior_retry_count >= self.escalation_cap {
            return None;
        }
        let task = self.tasks.get(task_idx)?;
        let escalated = match cause {
            ErrorCause::OutOfMemory => task.resources.escalate_mem(self.escalation_factor),
            ErrorCause::WallTimeKill => task.resources.escalate_time(self.escalation_factor),
            ErrorCause::Interrupted | ErrorCause::Permanent => task.resources.clone(),
        };
        tracing::debug!(
            job_id = %self.id,
            retry_count = prior_retry_count + 1,
            cause = ?cause,
            mem_gb = escalated.mem_gb,
            time_hours = escalated.time_hours,
            "escalating retry"
        );
        Some(escalated)
    }
}
