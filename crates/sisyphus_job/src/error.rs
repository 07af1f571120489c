use sisyphus_hash::HashError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Hash(#[from] HashError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Errors raised while running a task function, matching the causes the
/// worker must classify (`spec.md §4.G`, §7 "kind | source | policy").
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("no task named '{0}' on this job")]
    UnknownTask(String),
    /// The recipe's task function itself raised — recorded verbatim in
    /// `error.*` and never auto-retried (`spec.md §7`: "user-code-error").
    #[error("{0}")]
    UserCode(String),
}
