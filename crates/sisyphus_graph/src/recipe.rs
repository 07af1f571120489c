//! The typed builder API recipe code implements to describe a job graph
//! (`spec.md §9`: "model it as ... a typed builder API where
//! `tk.register_output` is the only side effect visible to the core" —
//! DESIGN.md pins this over an embedded scripting runtime).

use crate::Graph;

/// Re-registers a recipe's jobs and outputs into `graph`. Called once per
/// manager tick's graph-update phase (`spec.md §4.F` step 1: "re-execute
/// ... the recipe to obtain the live job set"); [`Graph::intern`]'s
/// canonicalization is what makes re-running this from scratch on every
/// tick cheap and idempotent rather than requiring incremental diffing.
pub trait Recipe: Send + Sync {
    fn build(&self, graph: &Graph);
}

impl<F> Recipe for F
where
    F: Fn(&Graph) + Send + Sync,
{
    fn build(&self, graph: &Graph) {
        self(graph)
    }
}
