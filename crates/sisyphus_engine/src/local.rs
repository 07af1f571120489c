//! The Local engine: an in-process worker pool with fixed `(cpu, gpu, mem)`
//! capacity, admitting by first-fit and dispatching workers as subprocesses
//! of the manager (`spec.md §4.E`).

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use sisyphus_job::ResourceRequirements;
use sisyphus_protocol::markers;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::engine::{Engine, EngineError, EngineTaskState, QueueSnapshot, TaskRef};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalCapacity {
    pub cpu: u32,
    pub mem_gb: f64,
    pub gpu: u32,
}

impl LocalCapacity {
    fn fits(&self, used: &LocalCapacity, want: &ResourceRequirements) -> bool {
        used.cpu + want.cpu <= self.cpu
            && used.mem_gb + want.mem_gb <= self.mem_gb
            && used.gpu + want.gpu <= self.gpu
    }

    fn release(&mut self, resources: &ResourceRequirements) {
        self.cpu = self.cpu.saturating_sub(resources.cpu);
        self.mem_gb = (self.mem_gb - resources.mem_gb).max(0.0);
        self.gpu = self.gpu.saturating_sub(resources.gpu);
    }
}

struct TaskRecord {
    state: EngineTaskState,
    resources: ResourceRequirements,
    pid: Option<u32>,
}

struct LocalEngineState {
    in_use: LocalCapacity,
    tasks: HashMap<TaskRef, TaskRecord>,
    pending: VecDeque<TaskRef>,
    cached_snapshot: Option<QueueSnapshot>,
}

/// Shared between `LocalEngine` and every completion-waiter task spawned by
/// [`spawn`], so a worker subprocess exiting can reach back in and free its
/// reserved capacity no matter how long after submission that happens.
struct LocalEngineInner {
    capacity: LocalCapacity,
    worker_binary: PathBuf,
    state: Mutex<LocalEngineState>,
}

/// `spec.md §4.E`: "an in-process worker pool with fixed `(cpu, gpu, mem)`
/// capacity; admission is first-fit by declared requirement; starts the
/// worker as a subprocess of the manager."
pub struct LocalEngine {
    inner: Arc<LocalEngineInner>,
}

impl LocalEngine {
    pub fn new(capacity: LocalCapacity, worker_binary: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(LocalEngineInner {
                capacity,
                worker_binary: worker_binary.into(),
                state: Mutex::new(LocalEngineState {
                    in_use: LocalCapacity {
                        cpu: 0,
                        mem_gb: 0.0,
                        gpu: 0,
                    },
                    tasks: HashMap::new(),
                    pending: VecDeque::new(),
                    cached_snapshot: None,
                }),
            }),
        }
    }
}

/// Spawn `task` as a worker subprocess and, once it exits, release its
/// reserved capacity and try to admit whatever is waiting in `pending`.
/// Taking `inner: &Arc<LocalEngineInner>` (rather than `&LocalEngine`)
/// keeps this callable from the detached completion-waiter, which only
/// ever holds a cloned `Arc`.
fn spawn(inner: &Arc<LocalEngineInner>, task: &TaskRef, resources: &ResourceRequirements) -> Result<u32, EngineError> {
    let shard = task.shard();
    let mut cmd = Command::new(&inner.worker_binary);
    cmd.arg("worker")
        .arg(&task.job_dir)
        .arg(&task.task)
        .arg(task.shard.to_string());
    let mut child = cmd
        .spawn()
        .map_err(|e| EngineError::SubmissionFailed(e.to_string()))?;
    let pid = child.id().ok_or_else(|| {
        EngineError::SubmissionFailed("worker process exited before a pid was observed".into())
    })?;
    debug!(job_dir = %task.job_dir.display(), task = %task.task, shard = shard.shard, pid, "spawned local worker");

    let task = task.clone();
    let resources = resources.clone();
    let inner = inner.clone();
    tokio::spawn(async move {
        let _ = child.wait().await;
        debug!(job_dir = %task.job_dir.display(), task = %task.task, "local worker exited");

        let mut state = inner.state.lock().unwrap();
        state.tasks.remove(&task);
        state.in_use.release(&resources);
        state.cached_snapshot = None;
        try_admit_pending(&inner, &mut state);
    });
    Ok(pid)
}

/// Drain `state.pending` while capacity allows, spawning each admitted
/// task. Called both on fresh submission and whenever a running task's
/// completion frees capacity.
fn try_admit_pending(inner: &Arc<LocalEngineInner>, state: &mut LocalEngineState) {
    while let Some(next) = state.pending.front().cloned() {
        let resources = state.tasks.get(&next).map(|r| r.resources.clone());
        let Some(resources) = resources else {
            state.pending.pop_front();
            continue;
        };
        if !inner.capacity.fits(&state.in_use, &resources) {
            break;
        }
        state.pending.pop_front();
        match spawn(inner, &next, &resources) {
            Ok(pid) => {
                state.in_use.cpu += resources.cpu;
                state.in_use.mem_gb += resources.mem_gb;
                state.in_use.gpu += resources.gpu;
                if let Some(record) = state.tasks.get_mut(&next) {
                    record.state = EngineTaskState::Running;
                    record.pid = Some(pid);
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to admit pending local task");
            }
        }
    }
    state.cached_snapshot = None;
}

fn lock(inner: &LocalEngineInner) -> MutexGuard<'_, LocalEngineState> {
    inner.state.lock().unwrap()
}

#[async_trait]
impl Engine for LocalEngine {
    async fn submit_task(
        &self,
        task: &TaskRef,
        resources: &ResourceRequirements,
    ) -> Result<(), EngineError> {
        std::fs::write(
            markers::path_in(&task.job_dir, &markers::engine_cmd_marker(task.shard())),
            format!("{} worker {} {} {}", self.inner.worker_binary.display(), task.job_dir.display(), task.task, task.shard),
        )?;
        std::fs::write(
            markers::path_in(&task.job_dir, &markers::submit_log_marker(task.shard())),
            "",
        )?;

        let mut state = lock(&self.inner);
        if self.inner.capacity.fits(&state.in_use, resources) {
            let pid = spawn(&self.inner, task, resources)?;
            state.in_use.cpu += resources.cpu;
            state.in_use.mem_gb += resources.mem_gb;
            state.in_use.gpu += resources.gpu;
            state.tasks.insert(
                task.clone(),
                TaskRecord {
                    state: EngineTaskState::Running,
                    resources: resources.clone(),
                    pid: Some(pid),
                },
            );
        } else {
            state.tasks.insert(
                task.clone(),
                TaskRecord {
                    state: EngineTaskState::Queued,
                    resources: resources.clone(),
                    pid: None,
                },
            );
            state.pending.push_back(task.clone());
        }
        state.cached_snapshot = None;
        Ok(())
    }

    async fn queue_state(&self) -> Result<QueueSnapshot, EngineError> {
        let mut state = lock(&self.inner);
        if let Some(snapshot) = &state.cached_snapshot {
            return Ok(snapshot.clone());
        }
        let snapshot: QueueSnapshot = state
            .tasks
            .iter()
            .map(|(task_ref, record)| (task_ref.clone(), record.state))
            .collect();
        state.cached_snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn task_state(&self, task: &TaskRef) -> Result<EngineTaskState, EngineError> {
        let state = lock(&self.inner);
        Ok(state
            .tasks
            .get(task)
            .map(|r| r.state)
            .unwrap_or(EngineTaskState::Unknown))
    }

    async fn kill(&self, task: &TaskRef) -> Result<(), EngineError> {
        let pid = {
            let state = lock(&self.inner);
            state.tasks.get(task).and_then(|r| r.pid)
        };
        let Some(pid) = pid else {
            return Ok(());
        };
        kill_pid(pid);
        Ok(())
    }

    async fn reset_cache(&self) {
        let mut state = lock(&self.inner);
        state.cached_snapshot = None;
        try_admit_pending(&self.inner, &mut state);
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    // SAFETY: libc::kill with a valid pid and SIGTERM is a simple signal
    // send; a race where the pid has already exited (and possibly been
    // reused) is the same best-effort risk the spec calls out explicitly
    // ("may race with completion").
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn kill_pid(_pid: u32) {
    tracing::warn!("Engine::kill is unimplemented on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_respects_all_three_dimensions() {
        let cap = LocalCapacity {
            cpu: 4,
            mem_gb: 16.0,
            gpu: 1,
        };
        let used = LocalCapacity {
            cpu: 3,
            mem_gb: 15.0,
            gpu: 0,
        };
        let want = ResourceRequirements::default().with_cpu(1).with_mem_gb(1.0);
        assert!(cap.fits(&used, &want));

        let want_too_much = ResourceRequirements::default().with_cpu(2);
        assert!(!cap.fits(&used, &want_too_much));
    }

    #[test]
    fn release_never_underflows_below_zero() {
        let mut used = LocalCapacity {
            cpu: 1,
            mem_gb: 2.0,
            gpu: 0,
        };
        let want = ResourceRequirements::default().with_cpu(4).with_mem_gb(8.0);
        used.release(&want);
        assert_eq!(used.cpu, 0);
        assert_eq!(used.mem_gb, 0.0);
    }

    #[tokio::test]
    async fn completed_task_frees_capacity_for_a_pending_one() {
        let capacity = LocalCapacity {
            cpu: 1,
            mem_gb: 1.0,
            gpu: 0,
        };
        let engine = LocalEngine::new(capacity, worker_binary_path());
        let dir = tempfile::tempdir().unwrap();

        let job_id = sisyphus_protocol::SisyphusId::new("recipes", "Count", "deadbeef");
        let first = TaskRef::new(job_id.clone(), dir.path(), "run", 0);
        let second = TaskRef::new(job_id, dir.path(), "run", 1);
        let resources = ResourceRequirements::default().with_cpu(1).with_mem_gb(1.0);

        engine.submit_task(&first, &resources).await.unwrap();
        engine.submit_task(&second, &resources).await.unwrap();

        // Second task couldn't fit alongside the first; it should be queued.
        assert_eq!(engine.task_state(&second).await.unwrap(), EngineTaskState::Queued);

        // The first worker subprocess exits almost immediately; once its
        // completion-waiter runs, the freed slot should admit the second.
        let mut admitted = false;
        for _ in 0..50 {
            if engine.task_state(&second).await.unwrap() != EngineTaskState::Queued {
                admitted = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(admitted, "second task should be admitted once the first releases capacity");
    }

    fn worker_binary_path() -> PathBuf {
        // A binary guaranteed to exit almost immediately so the
        // completion-waiter's `child.wait()` resolves quickly in tests.
        PathBuf::from("/bin/true")
    }
}
