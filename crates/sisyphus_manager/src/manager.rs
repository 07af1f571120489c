//! The control loop: alternating graph-update and dispatch phases on a
//! configurable interval (`spec.md §4.F`), cooperative shutdown at tick
//! boundaries, and a global pause distinct from shutdown.
//!
//! Grounded on `casparian_sentinel::Sentinel::run`/`run_with_shutdown`'s
//! event-loop shape (a `running` flag, an optional shutdown channel
//! checked with a non-blocking `try_recv` at the top of each iteration),
//! adapted from its synchronous `mpsc::Receiver` + blocking ZMQ recv to an
//! async tick on a `tokio` interval.

use std::fs;
use std::path::Path as StdPath;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sisyphus_engine::TaskRef;
use sisyphus_graph::{Graph, JobNode, Recipe};
use sisyphus_job::JobInfo;
use sisyphus_protocol::markers;
use sisyphus_settings::Settings;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::dispatch::{self, JobAction};
use crate::error::ManagerError;
use crate::materialize;

/// Tally of what one [`Manager::tick`] did, for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub continuations_woken: usize,
    pub submitted: usize,
    pub finished: usize,
    pub errored: usize,
    pub unknown: usize,
}

/// The control loop over a [`Graph`] of jobs a recipe builds, dispatching
/// through the [`Settings`]-configured engine. One `Manager` owns one
/// work directory; enforcing that there is only ever one is
/// [`crate::lockfile::ManagerLock`]'s job, not this type's.
pub struct Manager {
    graph: Arc<Graph>,
    settings: Arc<Settings>,
    recipe: Arc<dyn Recipe>,
    paused: AtomicBool,
}

impl Manager {
    pub fn new(graph: Arc<Graph>, settings: Arc<Settings>, recipe: Arc<dyn Recipe>) -> Self {
        Self {
            graph,
            settings,
            recipe,
            paused: AtomicBool::new(false),
        }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Halt the dispatch phase while continuing the graph-update phase —
    /// a distinct operation from shutdown, kept for observability while
    /// the graph is held still (`spec.md §4.F`: "Manual holds").
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// One graph-update-then-dispatch cycle.
    pub async fn tick(&self) -> Result<TickReport, ManagerError> {
        // Graph-update phase.
        self.recipe.build(&self.graph);
        self.settings.engine().reset_cache().await;
        let continuations_woken = self.graph.poll_continuations(&self.settings.work_dir);

        let mut report = TickReport {
            continuations_woken,
            ..TickReport::default()
        };

        if self.is_paused() {
            return Ok(report);
        }

        // One queue snapshot for the whole dispatch phase (`spec.md §4.E`:
        // "queue_state observations are tick-consistent").
        let queue_snapshot = self.settings.engine().queue_state().await?;

        // Iteration order over `live_jobs()` need not be topological: a
        // descendant's `input_paths()` can only become `available()` once
        // its predecessor's `finished.run` is already on disk, which can
        // never happen mid-tick from iteration order alone, only from a
        // worker process having actually finished.
        for node in self.graph.live_jobs() {
            let action = match dispatch::evaluate(node.as_ref(), &self.settings.work_dir) {
                Ok(action) => action,
                Err(err) => {
                    warn!(job_id = %node.id(), error = %err, "failed to evaluate job state");
                    continue;
                }
            };
            if let Err(err) = self.act(node.as_ref(), action, &queue_snapshot, &mut report).await {
                error!(job_id = %node.id(), error = %err, "failed to act on job");
            }
        }

        if self.settings.job_auto_cleanup {
            self.housekeep();
        }

        Ok(report)
    }

    async fn act(
        &self,
        node: &dyn JobNode,
        action: JobAction,
        queue_snapshot: &sisyphus_engine::QueueSnapshot,
        report: &mut TickReport,
    ) -> Result<(), ManagerError> {
        match action {
            JobAction::Waiting | JobAction::Held | JobAction::AlreadyFinished => Ok(()),
            JobAction::InFlight { task_name, running, .. } => {
                self.reconcile_in_flight(node, &task_name, &running, queue_snapshot)
            }
            JobAction::Unknown => {
                warn!(job_id = %node.id(), "contradictory markers, not auto-resolving");
                report.unknown += 1;
                Ok(())
            }
            JobAction::JustFinished => {
                let job_dir = node.work_dir(&self.settings.work_dir);
                write_marker_atomic(&job_dir, markers::FINISHED_RUN, "")?;
                info!(job_id = %node.id(), "job finished");
                report.finished += 1;
                Ok(())
            }
            JobAction::Errored { task_name, shard, message, .. } => {
                error!(job_id = %node.id(), task = task_name, shard, message, "job errored, not auto-retried");
                report.errored += 1;
                Ok(())
            }
            JobAction::EscalationExhausted { task_name, shard, .. } => {
                error!(job_id = %node.id(), task = task_name, shard, "retry escalation cap reached");
                report.errored += 1;
                Ok(())
            }
            JobAction::Submit {
                task_name,
                shards,
                resources,
                mini_task,
                is_retry,
                cause,
                ..
            } => {
                materialize::materialize(node, &self.settings.work_dir)?;
                let job_dir = node.work_dir(&self.settings.work_dir);

                if is_retry {
                    let mut job_info = JobInfo::load(&job_dir)?;
                    job_info.record_retry(
                        cause.unwrap_or_else(|| "unknown".to_string()),
                        Some(resources.mem_gb),
                        Some(resources.time_hours),
                        Utc::now(),
                    );
                    job_info.save(&job_dir)?;
                }

                for shard in shards {
                    let task_ref = TaskRef::new(node.id().clone(), job_dir.clone(), task_name.clone(), shard);
                    self.settings
                        .engine()
                        .submit_to(None, mini_task, &task_ref, &resources)
                        .await?;
                }
                info!(job_id = %node.id(), task = task_name, is_retry, "task submitted");
                report.submitted += 1;
                Ok(())
            }
        }
    }

    /// A shard marked `Running` on disk (a `log.*` with no `finished.*`/
    /// `error.*` yet) but absent from the engine's own queue snapshot means
    /// the engine lost track of it — almost always a manager crash that
    /// happened after the worker started but whose process also died
    /// (`spec.md §8` "crash recovery": "if no longer in queue and no
    /// `finished.*`, state is `interrupted` -> resubmit"). Write an
    /// `error.*` tagged `interrupted` so next tick's marker-only
    /// evaluation treats it as a transient failure eligible for retry.
    fn reconcile_in_flight(
        &self,
        node: &dyn JobNode,
        task_name: &str,
        running: &[u32],
        queue_snapshot: &sisyphus_engine::QueueSnapshot,
    ) -> Result<(), ManagerError> {
        let job_dir = node.work_dir(&self.settings.work_dir);
        for &shard in running {
            let task_ref = TaskRef::new(node.id().clone(), job_dir.clone(), task_name.to_string(), shard);
            let known = queue_snapshot
                .get(&task_ref)
                .map(|s| matches!(s, sisyphus_engine::EngineTaskState::Queued | sisyphus_engine::EngineTaskState::Running))
                .unwrap_or(false);
            if known {
                continue;
            }
            warn!(job_id = %node.id(), task = task_name, shard, "engine has no record of a running shard, marking interrupted");
            let body = format!("interrupted: engine lost task (manager restart at {})", Utc::now().to_rfc3339());
            write_marker_atomic(
                &job_dir,
                &markers::error_marker(sisyphus_protocol::markers::TaskShard::new(task_name, shard)),
                &body,
            )?;
        }
        Ok(())
    }

    fn housekeep(&self) {
        if let Err(err) = sisyphus_housekeeping::resync_symlinks(
            &self.graph,
            &self.settings.work_dir,
            &self.settings.work_dir.join("output"),
            &self.settings.work_dir.join("alias"),
        ) {
            warn!(error = %err, "failed to resync output/alias symlinks");
        }
        let grace_period = Duration::from_secs(self.settings.orphan_grace_period_secs);
        match sisyphus_housekeeping::remove_orphans(&self.graph, &self.settings.work_dir, grace_period) {
            Ok(removed) if !removed.is_empty() => {
                info!(count = removed.len(), "removed orphan job directories");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "failed to remove orphan job directories"),
        }
    }

    async fn run_loop(&self, mut stop_rx: Option<mpsc::Receiver<()>>) -> Result<(), ManagerError> {
        info!(work_dir = %self.settings.work_dir.display(), "manager started");
        loop {
            if let Some(rx) = stop_rx.as_mut() {
                match rx.try_recv() {
                    Ok(()) => {
                        info!("manager received shutdown signal");
                        break;
                    }
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        info!("manager shutdown channel closed");
                        break;
                    }
                    Err(mpsc::error::TryRecvError::Empty) => {}
                }
            }

            match self.tick().await {
                Ok(report) => {
                    if report.submitted > 0 || report.finished > 0 || report.errored > 0 {
                        info!(
                            submitted = report.submitted,
                            finished = report.finished,
                            errored = report.errored,
                            unknown = report.unknown,
                            "tick complete"
                        );
                    }
                }
                Err(err) => error!(error = %err, "tick failed"),
            }

            tokio::time::sleep(Duration::from_secs(self.settings.wait_period_between_checks_secs)).await;
        }
        info!("manager stopped");
        Ok(())
    }

    /// Run forever, ticking on `settings.wait_period_between_checks_secs`.
    pub async fn run(&self) -> Result<(), ManagerError> {
        self.run_loop(None).await
    }

    /// Run until `stop_rx` yields or is dropped, checked at the top of
    /// every tick boundary — never mid-tick (`spec.md §4.F`: "Termination
    /// ... stops submitting new work ... flushes state, and exits").
    pub async fn run_with_shutdown(&self, stop_rx: mpsc::Receiver<()>) -> Result<(), ManagerError> {
        self.run_loop(Some(stop_rx)).await
    }
}

fn write_marker_atomic(job_dir: &StdPath, marker: &str, body: &str) -> std::io::Result<()> {
    fs::create_dir_all(job_dir)?;
    let path = markers::path_in(job_dir, marker);
    let tmp = path.with_extension("tmp-write");
    fs::write(&tmp, body)?;
    fs::rename(&tmp, &path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sisyphus_engine::{Engine, EngineError, EngineSelector, EngineTaskState, QueueSnapshot};
    use sisyphus_hash::{Digest, HashCtx, HashError};
    use sisyphus_job::{Job, JobArgs, Task};
    use sisyphus_protocol::markers::TaskShard;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    /// Records every submission and immediately writes the shard's
    /// `finished.*` marker, standing in for a worker process that runs
    /// instantly — the manager-tick tests below exercise dispatch
    /// decisions, not actual task execution.
    #[derive(Default)]
    struct InstantEngine {
        submissions: StdMutex<Vec<TaskRef>>,
    }

    #[async_trait]
    impl Engine for InstantEngine {
        async fn submit_task(&self, task: &TaskRef, _resources: &sisyphus_job::ResourceRequirements) -> Result<(), EngineError> {
            self.submissions.lock().unwrap().push(task.clone());
            write_marker_atomic(&task.job_dir, &markers::finished_marker(task.shard()), "")?;
            Ok(())
        }
        async fn queue_state(&self) -> Result<QueueSnapshot, EngineError> {
            Ok(QueueSnapshot::new())
        }
        async fn task_state(&self, _task: &TaskRef) -> Result<EngineTaskState, EngineError> {
            Ok(EngineTaskState::Unknown)
        }
        async fn kill(&self, _task: &TaskRef) -> Result<(), EngineError> {
            Ok(())
        }
        async fn reset_cache(&self) {}
    }

    /// Records submissions but never finishes them, so a transient error
    /// marker written ahead of time is the only thing driving state.
    #[derive(Default)]
    struct RecordingEngine {
        submissions: StdMutex<Vec<(TaskRef, sisyphus_job::ResourceRequirements)>>,
    }

    #[async_trait]
    impl Engine for RecordingEngine {
        async fn submit_task(&self, task: &TaskRef, resources: &sisyphus_job::ResourceRequirements) -> Result<(), EngineError> {
            self.submissions.lock().unwrap().push((task.clone(), resources.clone()));
            Ok(())
        }
        async fn queue_state(&self) -> Result<QueueSnapshot, EngineError> {
            Ok(QueueSnapshot::new())
        }
        async fn task_state(&self, _task: &TaskRef) -> Result<EngineTaskState, EngineError> {
            Ok(EngineTaskState::Unknown)
        }
        async fn kill(&self, _task: &TaskRef) -> Result<(), EngineError> {
            Ok(())
        }
        async fn reset_cache(&self) {}
    }

    #[derive(Clone, serde::Serialize, serde::Deserialize)]
    struct Args {
        n: u64,
    }

    impl JobArgs for Args {
        fn kept_fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError> {
            sisyphus_hash::Fingerprint::fingerprint(&self.n, ctx)
        }
    }

    fn settings_with(work_dir: &StdPath, engine: Arc<dyn Engine>) -> Arc<Settings> {
        let selector = Arc::new(EngineSelector::new("local", "local").with_engine("local", engine));
        Arc::new(Settings::with_engine_selector(work_dir, selector))
    }

    #[tokio::test]
    async fn first_tick_submits_a_fresh_job_exactly_once() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(InstantEngine::default());
        let settings = settings_with(dir.path(), engine.clone());
        let graph = Arc::new(Graph::new());

        let recipe: Arc<dyn Recipe> = Arc::new(|graph: &Graph| {
            // Interning the same job twice in one recipe pass (the
            // "recipe constructs it from two call sites" case) must still
            // dispatch it exactly once.
            let job = Job::new("recipes", "Count", Args { n: 1 }, vec![Task::new("run")]).unwrap();
            graph.intern(job.clone());
            graph.intern(job);
        });

        let manager = Manager::new(graph, settings, recipe);
        let report = manager.tick().await.unwrap();
        assert_eq!(report.submitted, 1);
        assert_eq!(engine.submissions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dispatched_job_finishes_on_the_tick_after_its_shard_completes() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(InstantEngine::default());
        let settings = settings_with(dir.path(), engine);
        let graph = Arc::new(Graph::new());
        let recipe: Arc<dyn Recipe> = Arc::new(|graph: &Graph| {
            graph.intern(Job::new("recipes", "Count", Args { n: 1 }, vec![Task::new("run")]).unwrap());
        });
        let manager = Manager::new(graph, settings, recipe);

        let first = manager.tick().await.unwrap();
        assert_eq!(first.submitted, 1);
        assert_eq!(first.finished, 0);

        let second = manager.tick().await.unwrap();
        assert_eq!(second.submitted, 0);
        assert_eq!(second.finished, 1);
    }

    #[tokio::test]
    async fn transient_failure_is_resubmitted_with_escalated_resources() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(RecordingEngine::default());
        let settings = settings_with(dir.path(), engine.clone());
        let graph = Arc::new(Graph::new());
        let job = Job::new("recipes", "Count", Args { n: 1 }, vec![Task::new("run")]).unwrap();
        let job_dir = job.work_dir(dir.path());
        fs::create_dir_all(&job_dir).unwrap();
        fs::write(job_dir.join(markers::error_marker(TaskShard::new("run", 0))), "OOM: killed").unwrap();

        let recipe: Arc<dyn Recipe> = Arc::new(move |graph: &Graph| {
            graph.intern(job.clone());
        });
        let manager = Manager::new(graph, settings, recipe);

        let report = manager.tick().await.unwrap();
        assert_eq!(report.submitted, 1);
        let submissions = engine.submissions.lock().unwrap();
        assert_eq!(submissions.len(), 1);
        assert!(submissions[0].1.mem_gb > 1.0);

        let info = JobInfo::load(&job_dir).unwrap();
        assert_eq!(info.retry_count, 1);
    }

    #[tokio::test]
    async fn paused_manager_keeps_polling_continuations_but_never_dispatches() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(InstantEngine::default());
        let settings = settings_with(dir.path(), engine.clone());
        let graph = Arc::new(Graph::new());
        let recipe: Arc<dyn Recipe> = Arc::new(|graph: &Graph| {
            graph.intern(Job::new("recipes", "Count", Args { n: 1 }, vec![Task::new("run")]).unwrap());
        });
        let manager = Manager::new(graph, settings, recipe);
        manager.pause();

        let report = manager.tick().await.unwrap();
        assert_eq!(report.submitted, 0);
        assert!(engine.submissions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn still_queued_on_the_engine_is_left_alone() {
        // A `log.*` with no `finished.*`/`error.*` and the engine's own
        // snapshot reporting it `Running` is genuinely in flight: nothing
        // to do but wait (`spec.md §8` "if still running, state is
        // running").
        let dir = tempdir().unwrap();
        let job = Job::new("recipes", "Count", Args { n: 1 }, vec![Task::new("run")]).unwrap();
        let job_dir = job.work_dir(dir.path());
        fs::create_dir_all(&job_dir).unwrap();
        fs::write(job_dir.join(markers::log_marker(TaskShard::new("run", 0))), "started_at=...\n").unwrap();

        let engine = Arc::new(StubQueueEngine::running(job.id().clone(), job_dir.clone(), "run", 0));
        let settings = settings_with(dir.path(), engine.clone());
        let graph = Arc::new(Graph::new());
        let recipe: Arc<dyn Recipe> = Arc::new(move |graph: &Graph| {
            graph.intern(job.clone());
        });
        let manager = Manager::new(graph, settings, recipe);

        manager.tick().await.unwrap();
        assert!(!job_dir.join(markers::error_marker(TaskShard::new("run", 0))).exists());
    }

    #[tokio::test]
    async fn crash_recovery_marks_a_shard_interrupted_once_the_engine_loses_it() {
        // A worker wrote `log.*` (started) but the manager crashed before
        // observing `finished.*`/`error.*`; on restart the engine backend
        // has no record of the task at all -> treated as interrupted and
        // retried on a later tick (`spec.md §8` "if no longer in queue and
        // no `finished.*`, state is interrupted -> resubmit").
        let dir = tempdir().unwrap();
        let job = Job::new("recipes", "Count", Args { n: 1 }, vec![Task::new("run")]).unwrap();
        let job_dir = job.work_dir(dir.path());
        fs::create_dir_all(&job_dir).unwrap();
        fs::write(job_dir.join(markers::log_marker(TaskShard::new("run", 0))), "started_at=...\n").unwrap();

        let engine = Arc::new(RecordingEngine::default());
        let settings = settings_with(dir.path(), engine);
        let graph = Arc::new(Graph::new());
        let recipe: Arc<dyn Recipe> = Arc::new(move |graph: &Graph| {
            graph.intern(job.clone());
        });
        let manager = Manager::new(graph, settings, recipe);

        let report = manager.tick().await.unwrap();
        assert_eq!(report.submitted, 0);
        let error_path = job_dir.join(markers::error_marker(TaskShard::new("run", 0)));
        assert!(error_path.exists());
        assert!(fs::read_to_string(&error_path).unwrap().starts_with("interrupted"));

        // Next tick sees the interrupted marker and resubmits.
        let second = manager.tick().await.unwrap();
        assert_eq!(second.submitted, 1);
    }

    /// Reports a fixed queue snapshot regardless of what was submitted —
    /// used only to exercise [`Manager::reconcile_in_flight`]'s branch
    /// where the engine still vouches for a shard marked `Running`.
    #[derive(Default)]
    struct StubQueueEngine {
        known: QueueSnapshot,
    }

    impl StubQueueEngine {
        fn running(job_id: sisyphus_protocol::SisyphusId, job_dir: std::path::PathBuf, task: &str, shard: u32) -> Self {
            let mut known = QueueSnapshot::new();
            known.insert(TaskRef::new(job_id, job_dir, task.to_string(), shard), EngineTaskState::Running);
            Self { known }
        }
    }

    #[async_trait]
    impl Engine for StubQueueEngine {
        async fn submit_task(&self, _task: &TaskRef, _resources: &sisyphus_job::ResourceRequirements) -> Result<(), EngineError> {
            Ok(())
        }
        async fn queue_state(&self) -> Result<QueueSnapshot, EngineError> {
            Ok(self.known.clone())
        }
        async fn task_state(&self, task: &TaskRef) -> Result<EngineTaskState, EngineError> {
            Ok(self.known.get(task).copied().unwrap_or(EngineTaskState::Unknown))
        }
        async fn kill(&self, _task: &TaskRef) -> Result<(), EngineError> {
            Ok(())
        }
        async fn reset_cache(&self) {}
    }
}
