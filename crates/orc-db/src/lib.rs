//! orc-db -- embedded SQLite storage for the orchestrator.
//!
//! Two databases: the **project** database (`.orc/orc.db`) owns every
//! task-shaped entity plus the transcript full-text index, and the **global**
//! database (`~/.orc/global.db`) owns host-wide cost telemetry and budgets.
//!
//! All access goes through `tokio-rusqlite`; blocking work happens inside
//! `conn.call` closures on the connection's worker thread.

pub mod cost_store;
pub mod migrations;
pub mod phase_agent_store;
pub mod task_store;
pub mod transcript_store;

mod db;
mod sql_util;

pub use db::{GlobalDb, ProjectDb, SearchDialect};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying SQLite failure, wrapped with the operation name.
    #[error("{op}: {source}")]
    Db {
        op: &'static str,
        #[source]
        source: tokio_rusqlite::Error,
    },
    /// State-transition conflict: the row was missing or no longer in the
    /// state the update required.
    #[error("{0} not found or already processed")]
    Conflict(&'static str),
    #[error("branch already in use: {0}")]
    BranchTaken(String),
    #[error("builtin {0} cannot be deleted")]
    Builtin(&'static str),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Attach the operation name to a raw driver error.
pub(crate) trait DbResultExt<T> {
    fn op(self, op: &'static str) -> Result<T>;
}

impl<T> DbResultExt<T> for std::result::Result<T, tokio_rusqlite::Error> {
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|source| StoreError::Db { op, source })
    }
}

/// Empty strings on nullable foreign-key columns are stored as NULL.
pub(crate) fn empty_to_null(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_becomes_null() {
        assert_eq!(empty_to_null(Some(String::new())), None);
        assert_eq!(empty_to_null(Some("wf-1".into())), Some("wf-1".into()));
        assert_eq!(empty_to_null(None), None);
    }
}
