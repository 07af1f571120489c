//! The Graph: a canonicalization table over live jobs, the set of
//! registered outputs, alias/target bookkeeping, async continuations, and
//! traversal queries (`spec.md §4.D`).

pub mod continuation;
pub mod node;
pub mod recipe;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

pub use continuation::{async_run, ContinuationKey, PendingContinuation};
pub use node::JobNode;
pub use recipe::Recipe;

use sisyphus_job::{Job, JobArgs};
use sisyphus_protocol::{Path, SisyphusId};

#[derive(Default)]
struct GraphInner {
    /// Type-preserving storage, so `intern::<A>` can hand back an
    /// `Arc<Job<A>>` rather than only the type-erased view.
    canonical: HashMap<SisyphusId, Arc<dyn Any + Send + Sync>>,
    nodes: HashMap<SisyphusId, Arc<dyn JobNode>>,
    /// Reverse edges: id -> set of ids that depend on it. Built from each
    /// interned job's `input_paths()` creators.
    dependents: HashMap<SisyphusId, HashSet<SisyphusId>>,
    outputs: Vec<Path>,
    aliases: HashMap<String, SisyphusId>,
    targets: HashMap<String, Vec<SisyphusId>>,
    continuations: HashMap<ContinuationKey, Vec<PendingContinuation>>,
}

/// The in-memory DAG of jobs a single manager process is tracking.
/// Construction happens by recipe code running to completion and calling
/// [`Graph::intern`] from every job constructor; this type does not persist
/// itself — the filesystem markers under each job's work directory are the
/// durable state (`spec.md §9`).
#[derive(Default)]
pub struct Graph {
    inner: Mutex<GraphInner>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonicalize `job` by its sisyphus-id: if an equal id was already
    /// interned, the existing instance is returned instead and `job` is
    /// dropped (`spec.md §4.D`).
    ///
    /// Panics if the same sisyphus-id was previously interned with a
    /// different concrete argument type `A` — that can only happen if two
    /// distinct recipe classes' `class_name`s collide, which is a recipe
    /// authoring bug, not a runtime condition to recover from.
    pub fn intern<A>(&self, job: Job<A>) -> Arc<Job<A>>
    where
        A: JobArgs + Send + Sync + 'static,
    {
        let id = job.id().clone();
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.canonical.get(&id) {
            return existing
                .clone()
                .downcast::<Job<A>>()
                .unwrap_or_else(|_| panic!("sisyphus-id collision across distinct types: {id}"));
        }

        for input in job.input_paths() {
            if let Some(creator) = input.creator() {
                inner
                    .dependents
                    .entry(creator.clone())
                    .or_default()
                    .insert(id.clone());
            }
        }

        let arc = Arc::new(job);
        inner
            .canonical
            .insert(id.clone(), arc.clone() as Arc<dyn Any + Send + Sync>);
        inner.nodes.insert(id, arc.clone() as Arc<dyn JobNode>);
        arc
    }

    /// Pin `path` as a DAG root. Idempotent: registering the same path
    /// twice keeps one copy.
    pub fn register_output(&self, path: Path) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.outputs.contains(&path) {
            inner.outputs.push(path);
        }
    }

    pub fn outputs(&self) -> Vec<Path> {
        self.inner.lock().unwrap().outputs.clone()
    }

    pub fn set_alias(&self, alias: impl Into<String>, id: SisyphusId) {
        self.inner.lock().unwrap().aliases.insert(alias.into(), id);
    }

    pub fn alias(&self, alias: &str) -> Option<SisyphusId> {
        self.inner.lock().unwrap().aliases.get(alias).cloned()
    }

    /// Every registered `(alias, id)` pair, for rebuilding the `alias/`
    /// symlink tree (`spec.md §4.H`).
    pub fn aliases(&self) -> Vec<(String, SisyphusId)> {
        self.inner
            .lock()
            .unwrap()
            .aliases
            .iter()
            .map(|(alias, id)| (alias.clone(), id.clone()))
            .collect()
    }

    pub fn add_to_target(&self, target: impl Into<String>, id: SisyphusId) {
        self.inner
            .lock()
            .unwrap()
            .targets
            .entry(target.into())
            .or_default()
            .push(id);
    }

    pub fn target_members(&self, target: &str) -> Vec<SisyphusId> {
        self.inner
            .lock()
            .unwrap()
            .targets
            .get(target)
            .cloned()
            .unwrap_or_default()
    }

    /// Every live job, in no particular order. See [`Graph::topological_order`]
    /// for the ordered roots-to-leaves traversal.
    pub fn live_jobs(&self) -> Vec<Arc<dyn JobNode>> {
        self.inner.lock().unwrap().nodes.values().cloned().collect()
    }

    pub fn get(&self, id: &SisyphusId) -> Option<Arc<dyn JobNode>> {
        self.inner.lock().unwrap().nodes.get(id).cloned()
    }

    pub fn by_class(&self, class_name: &str) -> Vec<SisyphusId> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .values()
            .map(|n| n.id().clone())
            .filter(|id| id.class_name() == class_name)
            .collect()
    }

    pub fn by_prefix(&self, prefix: &str) -> Vec<SisyphusId> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .keys()
            .filter(|id| id.to_string().starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Jobs transitively depending on `id` (for subtree cleanup /
    /// "rerun this subtree"): a BFS over the reverse-edge index built
    /// during [`Graph::intern`].
    pub fn descendants(&self, id: &SisyphusId) -> Vec<SisyphusId> {
        let inner = self.inner.lock().unwrap();
        let mut seen = HashSet::new();
        let mut queue = vec![id.clone()];
        let mut out = Vec::new();
        while let Some(current) = queue.pop() {
            if let Some(children) = inner.dependents.get(&current) {
                for child in children {
                    if seen.insert(child.clone()) {
                        out.push(child.clone());
                        queue.push(child.clone());
                    }
                }
            }
        }
        out
    }

    /// The full set of live jobs, ordered so every registered output
    /// appears before the jobs it (transitively) depends on (`spec.md
    /// §4.D`: "topologically ordered roots-to-leaves"). This is a display
    /// ordering for consoles/diagnostics, not a dispatch order — dispatch
    /// must go ancestor-before-descendant, the reverse of this.
    pub fn topological_order(&self) -> Vec<SisyphusId> {
        let inner = self.inner.lock().unwrap();
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut stack: Vec<SisyphusId> = inner
            .outputs
            .iter()
            .filter_map(|p| p.creator().cloned())
            .collect();
        // Jobs with no creator-qualified output registered still count as
        // roots for display purposes if nothing depends on them via
        // inputs; fall back to every node once outputs are exhausted.
        stack.extend(inner.nodes.keys().cloned());

        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            order.push(id.clone());
            if let Some(node) = inner.nodes.get(&id) {
                for input in node.input_paths() {
                    if let Some(creator) = input.creator() {
                        if !seen.contains(creator) {
                            stack.push(creator.clone());
                        }
                    }
                }
            }
        }
        order
    }

    pub fn register_continuation(&self, key: ContinuationKey, pending: PendingContinuation) {
        self.inner
            .lock()
            .unwrap()
            .continuations
            .entry(key)
            .or_default()
            .push(pending);
    }

    /// Called once per manager tick: wake every continuation whose full
    /// path set is now `available()` under `work_dir` (`spec.md §4.D`).
    /// Returns the number of continuations woken.
    pub fn poll_continuations(&self, work_dir: &std::path::Path) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let ready_keys: Vec<ContinuationKey> = inner
            .continuations
            .iter()
            .filter(|(_, pendings)| {
                pendings
                    .first()
                    .map(|p| p.paths.iter().all(|path| path.available(work_dir)))
                    .unwrap_or(false)
            })
            .map(|(key, _)| key.clone())
            .collect();

        let mut woken = 0;
        for key in ready_keys {
            if let Some(pendings) = inner.continuations.remove(&key) {
                for pending in pendings {
                    if pending.fire() {
                        woken += 1;
                    }
                }
            }
        }
        woken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sisyphus_hash::{Digest, HashCtx, HashError};
    use sisyphus_job::{JobArgs, Task};
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

    fn job(n: u64) -> Job<Args> {
        Job::new("recipes", "Count", Args { n }, vec![Task::new("run")]).unwrap()
    }

    #[test]
    fn interning_the_same_id_twice_returns_the_same_instance() {
        let graph = Graph::new();
        let a = graph.intern(job(1));
        let b = graph.intern(job(1));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn interning_different_ids_keeps_both() {
        let graph = Graph::new();
        graph.intern(job(1));
        graph.intern(job(2));
        assert_eq!(graph.live_jobs().len(), 2);
    }

    #[derive(Clone, serde::Serialize, serde::Deserialize)]
    struct Downstream {
        upstream: Path,
    }

    impl JobArgs for Downstream {
        fn kept_fingerprint(&self, ctx: &mut HashCtx) -> Result<Digest, HashError> {
            sisyphus_hash::Fingerprint::fingerprint(&self.upstream, ctx)
        }

        fn input_paths(&self) -> Vec<Path> {
            vec![self.upstream.clone()]
        }
    }

    #[test]
    fn descendants_follow_input_path_creators() {
        let graph = Graph::new();
        let upstream = graph.intern(job(1));
        let upstream_output = upstream.output_path("out.txt");
        let downstream = Job::new(
            "recipes",
            "Downstream",
            Downstream {
                upstream: upstream_output,
            },
            vec![Task::new("run")],
        )
        .unwrap();
        let downstream = graph.intern(downstream);

        let descendants = graph.descendants(upstream.id());
        assert_eq!(descendants, vec![downstream.id().clone()]);
    }

    #[tokio::test]
    async fn async_run_resolves_once_path_becomes_available() {
        let dir = tempdir().unwrap();
        let graph = Arc::new(Graph::new());
        let file = dir.path().join("out.txt");
        let target = Path::absolute(&file);

        let graph2 = graph.clone();
        let work_dir = dir.path().to_path_buf();
        let target2 = target.clone();
        let handle = tokio::spawn(async move {
            async_run(&graph2, &work_dir, vec![target2]).await.unwrap();
        });

        tokio::task::yield_now().await;
        std::fs::write(&file, b"done").unwrap();
        // Give the spawned task a chance to register before polling.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let woken = graph.poll_continuations(dir.path());
        assert!(woken <= 1);
        handle.await.unwrap();
    }
}
