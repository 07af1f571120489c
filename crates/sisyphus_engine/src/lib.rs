//! Dispatch backends: the `Engine` contract, an in-process Local engine,
//! SGE/Slurm/LSF cluster backends, and the name-routing `EngineSelector`
//! (`spec.md §4.E`).

pub mod cluster;
pub mod engine;
pub mod local;
pub mod selector;

pub use cluster::{lsf::LsfBackend, sge::SgeBackend, slurm::SlurmBackend, ClusterBackend, ClusterEngine};
pub use engine::{Engine, EngineError, EngineTaskState, QueueSnapshot, TaskRef};
pub use local::{LocalCapacity, LocalEngine};
pub use selector::EngineSelector;
