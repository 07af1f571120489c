//! Per-job dispatch decisions: walking a job's tasks in declaration order
//! to decide what the dispatch phase should do with it this tick
//! (`spec.md §4.F`).

use std::fs;
use std::path::Path;

use sisyphus_graph::JobNode;
use sisyphus_job::{classify_error_body, shard_state, JobInfo, ResourceRequirements, ShardMarkerState};
use sisyphus_protocol::markers::{self, TaskShard};

/// What the dispatch phase should do about one job this tick, after
/// walking its tasks in declaration order.
#[derive(Debug)]
pub enum JobAction {
    /// Not all input paths are `available()` yet.
    Waiting,
    /// `hold` marker present.
    Held,
    /// `finished.run` already present.
    AlreadyFinished,
    /// Every task's every shard is finished for the first time this tick —
    /// the caller should write `finished.run`.
    JustFinished,
    /// A task has shards submitted or running per the filesystem alone —
    /// the caller should reconcile against the engine's queue snapshot to
    /// tell genuinely in-flight shards apart from ones an engine lost
    /// track of (e.g. a crashed manager's engine state, `spec.md §8`
    /// "crash recovery"), since this evaluation never touches the engine.
    InFlight {
        task_idx: usize,
        task_name: String,
        running: Vec<u32>,
        submitted: Vec<u32>,
    },
    /// `task_idx`'s shards in `shards` need (re)submission with
    /// `resources`. `is_retry` distinguishes a fresh dispatch from a
    /// post-escalation resubmit (for `info` bookkeeping and logging only —
    /// the worker decides the entry point itself from its own marker
    /// inspection, `spec.md §4.C` DESIGN.md pinned semantics).
    Submit {
        task_idx: usize,
        task_name: String,
        shards: Vec<u32>,
        resources: ResourceRequirements,
        mini_task: bool,
        is_retry: bool,
        cause: Option<String>,
    },
    /// A shard failed permanently; surface it, no auto-retry (`spec.md
    /// §7`: "user-code-error").
    Errored {
        task_idx: usize,
        task_name: String,
        shard: u32,
        message: String,
    },
    /// A transient failure whose escalation cap has already been reached —
    /// treated as a terminal error (`spec.md §4.C`: "up to a configured
    /// cap").
    EscalationExhausted {
        task_idx: usize,
        task_name: String,
        shard: u32,
    },
    /// Marker files contradict each other; never auto-resolved (`spec.md
    /// §7`: "inconsistent-markers").
    Unknown,
}

/// Walk `node`'s tasks in order and decide the single next action
/// (`spec.md §4.F` dispatch phase). Reads only markers and `info` — never
/// touches the engine.
pub fn evaluate(node: &dyn JobNode, work_dir: &Path) -> std::io::Result<JobAction> {
    let job_dir = node.work_dir(work_dir);

    if markers::path_in(&job_dir, markers::HOLD).exists() {
        return Ok(JobAction::Held);
    }
    if markers::path_in(&job_dir, markers::FINISHED_RUN).exists() {
        return Ok(JobAction::AlreadyFinished);
    }

    let inputs_available = node
        .input_paths()
        .iter()
        .all(|p| p.available(work_dir));
    if !inputs_available {
        return Ok(JobAction::Waiting);
    }

    let info = JobInfo::load(&job_dir)?;

    for (task_idx, task) in node.tasks().iter().enumerate() {
        let shards: Vec<TaskShard<'_>> = (0..task.shard_count)
            .map(|shard| TaskShard::new(&task.function_name, shard))
            .collect();

        let mut all_finished = true;
        let mut permanent: Option<u32> = None;
        let mut transient: Vec<u32> = Vec::new();
        let mut fresh: Vec<u32> = Vec::new();
        let mut running: Vec<u32> = Vec::new();
        let mut submitted: Vec<u32> = Vec::new();

        for shard in &shards {
            match shard_state(&job_dir, *shard)? {
                ShardMarkerState::Finished => {}
                ShardMarkerState::Contradiction => return Ok(JobAction::Unknown),
                ShardMarkerState::ErrorPermanent => {
                    all_finished = false;
                    permanent.get_or_insert(shard.shard);
                }
                ShardMarkerState::ErrorTransient => {
                    all_finished = false;
                    transient.push(shard.shard);
                }
                ShardMarkerState::Running => {
                    all_finished = false;
                    running.push(shard.shard);
                }
                ShardMarkerState::Submitted => {
                    all_finished = false;
                    submitted.push(shard.shard);
                }
                ShardMarkerState::None => {
                    all_finished = false;
                    fresh.push(shard.shard);
                }
            }
        }

        if all_finished {
            continue;
        }

        if let Some(shard) = permanent {
            let body = fs::read_to_string(markers::path_in(
                &job_dir,
                &markers::error_marker(TaskShard::new(&task.function_name, shard)),
            ))
            .unwrap_or_default();
            return Ok(JobAction::Errored {
                task_idx,
                task_name: task.function_name.clone(),
                shard,
                message: body,
            });
        }

        if !transient.is_empty() {
            let shard = transient[0];
            let body = fs::read_to_string(markers::path_in(
                &job_dir,
                &markers::error_marker(TaskShard::new(&task.function_name, shard)),
            ))
            .unwrap_or_default();
            let cause = classify_error_body(&body);
            return Ok(match node.escalated_resources(task_idx, cause, info.retry_count) {
                Some(resources) => JobAction::Submit {
                    task_idx,
                    task_name: task.function_name.clone(),
                    shards: transient,
                    resources,
                    mini_task: task.mini_task,
                    is_retry: true,
                    cause: Some(format!("{cause:?}")),
                },
                None => JobAction::EscalationExhausted {
                    task_idx,
                    task_name: task.function_name.clone(),
                    shard,
                },
            });
        }

        if !running.is_empty() || !submitted.is_empty() {
            return Ok(JobAction::InFlight {
                task_idx,
                task_name: task.function_name.clone(),
                running,
                submitted,
            });
        }

        // No markers at all for this task's pending shards: first dispatch.
        return Ok(JobAction::Submit {
            task_idx,
            task_name: task.function_name.clone(),
            shards: fresh,
            resources: task.resources.clone(),
            mini_task: task.mini_task,
            is_retry: false,
            cause: None,
        });
    }

    Ok(JobAction::JustFinished)
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

    fn job() -> Job<Args> {
        Job::new("recipes", "Count", Args { n: 1 }, vec![Task::new("run")]).unwrap()
    }

    #[test]
    fn no_job_dir_yet_with_no_inputs_is_submit() {
        let dir = tempdir().unwrap();
        let job = job();
        let action = evaluate(&job, dir.path()).unwrap();
        assert!(matches!(action, JobAction::Submit { is_retry: false, .. }));
    }

    #[test]
    fn waiting_job_with_unavailable_input_stays_waiting() {
        let dir = tempdir().unwrap();
        let upstream_id = sisyphus_protocol::SisyphusId::new("recipes", "Up", "deadbeef");
        let job = Job::new(
            "recipes",
            "Down",
            DownArgs {
                upstream: sisyphus_protocol::Path::relative(upstream_id, "out.txt"),
            },
            vec![Task::new("run")],
        )
        .unwrap();
        let action = evaluate(&job, dir.path()).unwrap();
        assert!(matches!(action, JobAction::Waiting));
    }

    #[derive(Clone, serde::Serialize, serde::Deserialize)]
    struct DownArgs {
        upstream: sisyphus_protocol::Path,
    }

    impl JobArgs for DownArgs {
        fn kept_fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError> {
            sisyphus_hash::Fingerprint::fingerprint(&self.upstream, ctx)
        }

        fn input_paths(&self) -> Vec<sisyphus_protocol::Path> {
            vec![self.upstream.clone()]
        }
    }

    #[test]
    fn finished_shard_advances_to_just_finished() {
        let dir = tempdir().unwrap();
        let job = job();
        let job_dir = job.work_dir(dir.path());
        fs::create_dir_all(&job_dir).unwrap();
        fs::write(
            job_dir.join(markers::finished_marker(TaskShard::new("run", 0))),
            "",
        )
        .unwrap();
        let action = evaluate(&job, dir.path()).unwrap();
        assert!(matches!(action, JobAction::JustFinished));
    }

    #[test]
    fn permanent_error_surfaces_without_escalation() {
        let dir = tempdir().unwrap();
        let job = job();
        let job_dir = job.work_dir(dir.path());
        fs::create_dir_all(&job_dir).unwrap();
        fs::write(
            job_dir.join(markers::error_marker(TaskShard::new("run", 0))),
            "ValueError: boom",
        )
        .unwrap();
        let action = evaluate(&job, dir.path()).unwrap();
        assert!(matches!(action, JobAction::Errored { .. }));
    }

    #[test]
    fn transient_error_yields_escalated_submit() {
        let dir = tempdir().unwrap();
        let job = job();
        let job_dir = job.work_dir(dir.path());
        fs::create_dir_all(&job_dir).unwrap();
        fs::write(
            job_dir.join(markers::error_marker(TaskShard::new("run", 0))),
            "OOM: killed",
        )
        .unwrap();
        let action = evaluate(&job, dir.path()).unwrap();
        match action {
            JobAction::Submit { is_retry, resources, .. } => {
                assert!(is_retry);
                assert!(resources.mem_gb > 1.0);
            }
            other => panic!("expected Submit, got {other:?}"),
        }
    }

    #[test]
    fn hold_marker_overrides_everything() {
        let dir = tempdir().unwrap();
        let job = job();
        let job_dir = job.work_dir(dir.path());
        fs::create_dir_all(&job_dir).unwrap();
        fs::write(job_dir.join(markers::HOLD), "").unwrap();
        let action = evaluate(&job, dir.path()).unwrap();
        assert!(matches!(action, JobAction::Held));
    }
}
