use thiserror::Error;

/// Errors the Hasher can raise. Both are considered user-recipe bugs
/// (`spec.md §7`: `graph-cycle` / `non-hashable`) and are fatal to the
/// current manager tick rather than silently worked around.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HashError {
    /// A recursive structure was encountered while hashing. Well-formed
    /// recipes never produce this; it indicates the recipe built a job
    /// graph with a cycle in its argument values.
    #[error("non-hashable cycle detected while hashing {type_name}")]
    NonHashableCycle { type_name: &'static str },

    /// A value refused hashing outright (e.g. NaN in a context where it
    /// would make two "equal" jobs hash differently across runs, or a
    /// user type that didn't implement `Fingerprint` and fell back to a
    /// refusing default).
    #[error("value of type {type_name} is not hashable: {reason}")]
    NotHashable {
        type_name: &'static str,
        reason: String,
    },
}
