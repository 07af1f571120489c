//! Errors the manager's control loop can surface.

use thiserror::Error;

use sisyphus_engine::EngineError;
use sisyphus_job::JobError;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Lockfile(#[from] crate::lockfile::LockfileError),
}
