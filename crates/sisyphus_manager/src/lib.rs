//! The control loop: graph-update and dispatch phases, retry escalation,
//! holds, and cooperative shutdown (`spec.md §4.F`).

pub mod dispatch;
pub mod error;
pub mod lockfile;
pub mod manager;
pub mod materialize;

pub use dispatch::JobAction;
pub use error::ManagerError;
pub use lockfile::{LockfileError, ManagerLock};
pub use manager::{Manager, TickReport};
