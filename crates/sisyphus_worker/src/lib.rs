//! One-shot task execution: the subprocess an Engine invokes as
//! `worker <job_dir> <task> [shard]` (`spec.md §4.G`).

pub mod lock;
pub mod registry;
pub mod worker;

pub use lock::{LockError, ShardLockGuard};
pub use registry::{RegistryError, TaskRegistry};
pub use worker::{run, WorkerError};
