//! Shared types for Sisyphus's manager, worker and engines.
//!
//! This crate owns the three things every process in the system must agree
//! on without ever sharing memory (`spec.md §3`, §9):
//!
//! - the on-disk marker vocabulary ([`markers`]) and where jobs live
//!   ([`paths`], [`sisyphus_id`]);
//! - the `Path`/`Variable` data model for typed handles to job outputs
//!   ([`pathvar`]);
//! - the [`role::ProcessRole`] gate that keeps manager code from reading
//!   `Variable` payloads.

pub mod defaults;
pub mod markers;
pub mod naming;
pub mod pathvar;
pub mod paths;
pub mod role;
pub mod sisyphus_id;

pub use pathvar::{Location, Path, PathError, Variable, VariableError};
pub use role::ProcessRole;
pub use sisyphus_id::{SisyphusId, SisyphusIdError};
