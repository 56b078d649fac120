//! orc-initiatives -- grouping tasks under a shared context with a
//! dependency DAG.
//!
//! Initiatives are owned by the filesystem: each lives at
//! `<base>/<INIT-id>/initiative.yaml` and the YAML is the source of truth.
//! A projection into the project database serves UI queries; it is synced
//! best-effort on every write and can be rebuilt (DB from files) or used for
//! recovery (files from DB) when the two sides disagree.

pub mod dag;
pub mod manifest;
pub mod store;
pub mod types;

pub use dag::DependencyError;
pub use store::{InitiativeError, InitiativeStore};
pub use types::{
    BlockerInfo, Decision, Initiative, InitiativeStatus, MergeStatus, Owner, TaskOverlay,
    TaskRef, TaskStatusLoader,
};
