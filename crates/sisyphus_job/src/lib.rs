//! Job & Task: declared inputs/outputs, resource requirements, and the
//! marker-derived job state machine (`spec.md §4.C`).

pub mod error;
pub mod info;
pub mod job;
pub mod resources;
pub mod state;
pub mod task;

pub use error::{JobError, TaskError};
pub use info::JobInfo;
pub use job::{Job, JobArgs};
pub use resources::ResourceRequirements;
pub use state::{derive_job_state, classify_error_body, shard_state, ErrorCause, JobState, ShardMarkerState};
pub use task::Task;
