//! The job state machine, derived by reading markers — never stored
//! directly (`spec.md §4.C`).

use std::path::Path;

use sisyphus_protocol::markers::{self, TaskShard};

/// A job's lifecycle state, computed fresh from the filesystem on every
/// read. Two orthogonal states (`Hold`, `Unknown`) can override any point
/// on the main progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Not all input paths are `available()` yet.
    Waiting,
    /// All inputs are available; no submit/log/finished/error markers.
    Runnable,
    /// `submit_log.*` present, no `log.*` yet.
    Queued,
    /// `log.*` present, no `finished.*`/`error.*` yet.
    Running,
    /// Every task/shard has a `finished.*` marker (or `finished.run`).
    Finished,
    /// An `error.*` marker indicates a non-retryable failure.
    Error,
    /// An `error.*` marker indicates a transient cause (OOM, time-kill,
    /// SIGTERM-before-finish) that retry escalation may resolve.
    Interrupted,
    /// `hold` marker present: the manager must not schedule this job,
    /// regardless of what the rest of the markers say.
    Hold,
    /// Marker files contradict each other (e.g. both `finished.*` and
    /// `error.*` for the same shard). Never auto-resolved.
    Unknown,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Error)
    }

    pub fn is_schedulable(self) -> bool {
        matches!(self, JobState::Runnable)
    }
}

/// One shard's observed marker set, for a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardMarkerState {
    None,
    Submitted,
    Running,
    Finished,
    ErrorTransient,
    ErrorPermanent,
    Contradiction,
}

/// Classify an error marker's body as transient (retry-eligible) or
/// permanent. Grounded on the cause tags the worker writes to `error.*`
/// (`spec.md §9`, DESIGN.md "interrupted-vs-errored classification"):
/// SIGTERM-before-finish and engine-reported OOM/time-kill are transient;
/// a non-zero exit with no signal is the recipe's own code raising, and is
/// not retried automatically.
pub fn classify_error_body(body: &str) -> ErrorCause {
    let trimmed = body.trim_start();
    if trimmed.starts_with("SIGTERM") || trimmed.starts_with("interrupted") {
        ErrorCause::Interrupted
    } else if trimmed.starts_with("OOM") || trimmed.contains("out of memory") {
        ErrorCause::OutOfMemory
    } else if trimmed.starts_with("TIMEKILL") || trimmed.contains("wall-time") {
        ErrorCause::WallTimeKill
    } else {
        ErrorCause::Permanent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCause {
    Interrupted,
    OutOfMemory,
    WallTimeKill,
    Permanent,
}

impl ErrorCause {
    pub fn is_transient(self) -> bool {
        !matches!(self, ErrorCause::Permanent)
    }
}

/// The marker-derived state of a single shard, independent of any other
/// task's shards. Exposed for callers (the manager's per-task dispatch
/// walk, `spec.md §4.F`) that need to step through a job's tasks in
/// declaration order rather than [`derive_job_state`]'s all-shards-at-once
/// view.
pub fn shard_state(job_dir: &Path, shard: TaskShard<'_>) -> std::io::Result<ShardMarkerState> {
    let finished = markers::path_in(job_dir, &markers::finished_marker(shard)).exists();
    let error_path = markers::path_in(job_dir, &markers::error_marker(shard));
    let errored = error_path.exists();
    let running = markers::path_in(job_dir, &markers::log_marker(shard)).exists();
    let submitted = markers::path_in(job_dir, &markers::submit_log_marker(shard)).exists();

    if finished && errored {
        return Ok(ShardMarkerState::Contradiction);
    }
    if finished {
        return Ok(ShardMarkerState::Finished);
    }
    if errored {
        let body = std::fs::read_to_string(&error_path)?;
        return Ok(match classify_error_body(&body) {
            ErrorCause::Permanent => ShardMarkerState::ErrorPermanent,
            _ => ShardMarkerState::ErrorTransient,
        });
    }
    if running {
        return Ok(ShardMarkerState::Running);
    }
    if submitted {
        return Ok(ShardMarkerState::Submitted);
    }
    Ok(ShardMarkerState::None)
}

/// Derive the overall [`JobState`] for a job from its shard states and
/// `inputs_available`/`hold` facts the caller already knows (`spec.md
/// §4.C`).
pub fn derive_job_state(
    job_dir: &Path,
    shards: &[TaskShard<'_>],
    inputs_available: bool,
) -> std::io::Result<JobState> {
    if markers::path_in(job_dir, markers::HOLD).exists() {
        return Ok(JobState::Hold);
    }
    if !job_dir.exists() {
        return Ok(JobState::Waiting);
    }
    if markers::path_in(job_dir, markers::FINISHED_RUN).exists() {
        return Ok(JobState::Finished);
    }

    let mut states = Vec::with_capacity(shards.len());
    for shard in shards {
        states.push(shard_state(job_dir, *shard)?);
    }

    if states.iter().any(|s| *s == ShardMarkerState::Contradiction) {
        return Ok(JobState::Unknown);
    }
    if !states.is_empty() && states.iter().all(|s| *s == ShardMarkerState::Finished) {
        return Ok(JobState::Finished);
    }
    if states
        .iter()
        .any(|s| *s == ShardMarkerState::ErrorPermanent)
    {
        return Ok(JobState::Error);
    }
    if states
        .iter()
        .any(|s| *s == ShardMarkerState::ErrorTransient)
    {
        return Ok(JobState::Interrupted);
    }
    if states.iter().any(|s| *s == ShardMarkerState::Running) {
        return Ok(JobState::Running);
    }
    if states.iter().any(|s| *s == ShardMarkerState::Submitted) {
        return Ok(JobState::Queued);
    }
    if !inputs_available {
        return Ok(JobState::Waiting);
    }
    Ok(JobState::Runnable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn absent_directory_is_waiting() {
        let dir = tempdir().unwrap();
        let job_dir = dir.path().join("nope");
        let state = derive_job_state(&job_dir, &[TaskShard::new("run", 0)], true).unwrap();
        assert_eq!(state, JobState::Waiting);
    }

    #[test]
    fn no_markers_with_inputs_available_is_runnable() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path()).unwrap();
        let state = derive_job_state(dir.path(), &[TaskShard::new("run", 0)], true).unwrap();
        assert_eq!(state, JobState::Runnable);
    }

    #[test]
    fn no_markers_with_inputs_unavailable_is_waiting() {
        let dir = tempdir().unwrap();
        let state = derive_job_state(dir.path(), &[TaskShard::new("run", 0)], false).unwrap();
        assert_eq!(state, JobState::Waiting);
    }

    #[test]
    fn submit_then_log_then_finished_progress_in_order() {
        let dir = tempdir().unwrap();
        let shard = TaskShard::new("run", 0);

        fs::write(dir.path().join(markers::submit_log_marker(shard)), "").unwrap();
        assert_eq!(
            derive_job_state(dir.path(), &[shard], true).unwrap(),
            JobState::Queued
        );

        fs::write(dir.path().join(markers::log_marker(shard)), "").unwrap();
        assert_eq!(
            derive_job_state(dir.path(), &[shard], true).unwrap(),
            JobState::Running
        );

        fs::write(dir.path().join(markers::finished_marker(shard)), "").unwrap();
        assert_eq!(
            derive_job_state(dir.path(), &[shard], true).unwrap(),
            JobState::Finished
        );
    }

    #[test]
    fn oom_error_is_interrupted_not_permanent() {
        let dir = tempdir().unwrap();
        let shard = TaskShard::new("run", 0);
        fs::write(
            dir.path().join(markers::error_marker(shard)),
            "OOM: killed at 16GB",
        )
        .unwrap();
        assert_eq!(
            derive_job_state(dir.path(), &[shard], true).unwrap(),
            JobState::Interrupted
        );
    }

    #[test]
    fn plain_exception_is_a_permanent_error() {
        let dir = tempdir().unwrap();
        let shard = TaskShard::new("run", 0);
        fs::write(
            dir.path().join(markers::error_marker(shard)),
            "ValueError: bad input",
        )
        .unwrap();
        assert_eq!(
            derive_job_state(dir.path(), &[shard], true).unwrap(),
            JobState::Error
        );
    }

    #[test]
    fn contradictory_markers_are_unknown() {
        let dir = tempdir().unwrap();
        let shard = TaskShard::new("run", 0);
        fs::write(dir.path().join(markers::finished_marker(shard)), "").unwrap();
        fs::write(dir.path().join(markers::error_marker(shard)), "boom").unwrap();
        assert_eq!(
            derive_job_state(dir.path(), &[shard], true).unwrap(),
            JobState::Unknown
        );
    }

    #[test]
    fn hold_overrides_everything() {
        let dir = tempdir().unwrap();
        let shard = TaskShard::new("run", 0);
        fs::write(dir.path().join(markers::finished_marker(shard)), "").unwrap();
        fs::write(dir.path().join(markers::HOLD), "").unwrap();
        assert_eq!(
            derive_job_state(dir.path(), &[shard], true).unwrap(),
            JobState::Hold
        );
    }
}
