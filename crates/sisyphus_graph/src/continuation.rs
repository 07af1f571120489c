//! Async recipe support (`spec.md §4.D`): when recipe code suspends on
//! `async_run(target)`, the Graph records a continuation keyed by the set
//! of paths the target depends on, and wakes it once every one of those
//! paths is `available()`.

use std::collections::BTreeSet;

use sisyphus_hash::HashError;
use sisyphus_protocol::Path;
use tokio::sync::oneshot;

/// Identifies a continuation by the content digests of the paths it is
/// blocked on — order-independent, since "the set of paths" is unordered
/// in the spec's own wording.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContinuationKey(BTreeSet<String>);

impl ContinuationKey {
    pub fn new(paths: &[Path]) -> Result<Self, HashError> {
        let mut digests = BTreeSet::new();
        for path in paths {
            digests.insert(sisyphus_hash::hash(path)?.to_hex());
        }
        Ok(Self(digests))
    }
}

pub struct PendingContinuation {
    pub paths: Vec<Path>,
    waker: oneshot::Sender<()>,
}

impl PendingContinuation {
    pub fn new(paths: Vec<Path>, waker: oneshot::Sender<()>) -> Self {
        Self { paths, waker }
    }

    /// Consume this continuation and wake its waiting recipe task. Returns
    /// `false` if the receiving side was already dropped (the recipe task
    /// was cancelled), which callers should treat as "discard, don't
    /// retry".
    pub fn fire(self) -> bool {
        self.waker.send(()).is_ok()
    }
}

/// Awaited by recipe code: suspends until every path in `targets` is
/// `available()` under `work_dir`, registering a continuation with the
/// graph if they aren't yet. The manager's tick loop is what actually
/// drives progress by calling [`super::Graph::poll_continuations`].
pub async fn async_run(
    graph: &super::Graph,
    work_dir: &std::path::Path,
    targets: Vec<Path>,
) -> Result<(), HashError> {
    if targets.iter().all(|p| p.available(work_dir)) {
        return Ok(());
    }
    let key = ContinuationKey::new(&targets)?;
    let (tx, rx) = oneshot::channel();
    graph.register_continuation(key, PendingContinuation::new(targets, tx));
    let _ = rx.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_order_independent() {
        let a = Path::absolute("/a");
        let b = Path::absolute("/b");
        let k1 = ContinuationKey::new(&[a.clone(), b.clone()]).unwrap();
        let k2 = ContinuationKey::new(&[b, a]).unwrap();
        assert_eq!(k1, k2);
    }
}
