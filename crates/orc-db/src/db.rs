use std::path::Path;

use rusqlite::TransactionBehavior;
use tokio_rusqlite::Connection;

use crate::migrations::{
    apply_migrations, global_migrations, project_migrations, GLOBAL_FAMILY, PROJECT_FAMILY,
};
use crate::{DbResultExt, Result};

// ---------------------------------------------------------------------------
// SearchDialect
// ---------------------------------------------------------------------------

/// How transcript search runs against this database.
///
/// FTS5 is probed at open; when the SQLite build lacks it, search degrades
/// to a `LIKE` scan instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchDialect {
    Fts5,
    Like,
}

fn probe_fts5(conn: &rusqlite::Connection) -> bool {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS fts5_probe USING fts5(x);
         DROP TABLE IF EXISTS fts5_probe;",
    )
    .is_ok()
}

fn apply_pragmas(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
    conn.execute_batch(
        "PRAGMA synchronous=NORMAL;
         PRAGMA temp_store=MEMORY;
         PRAGMA busy_timeout=5000;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// ProjectDb
// ---------------------------------------------------------------------------

/// Handle on a project database (`.orc/orc.db`).
#[derive(Clone)]
pub struct ProjectDb {
    conn: Connection,
    dialect: SearchDialect,
}

impl ProjectDb {
    /// Open (or create) the project database at the given path and bring its
    /// schema up to date.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await.op("open project db")?;
        Self::init(conn).await
    }

    /// Purely in-memory database (tests).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await.op("open project db")?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        let dialect = conn
            .call(|conn| {
                apply_pragmas(conn)?;
                let dialect = if probe_fts5(conn) {
                    SearchDialect::Fts5
                } else {
                    SearchDialect::Like
                };
                apply_migrations(
                    conn,
                    PROJECT_FAMILY,
                    &project_migrations(dialect == SearchDialect::Fts5),
                )?;
                Ok(dialect)
            })
            .await
            .op("migrate project db")?;

        if dialect == SearchDialect::Like {
            tracing::warn!("sqlite build lacks FTS5; transcript search degrades to LIKE");
        }

        Ok(Self { conn, dialect })
    }

    pub fn connection(&self) -> Connection {
        self.conn.clone()
    }

    pub fn dialect(&self) -> SearchDialect {
        self.dialect
    }

    /// Run a closure inside one immediate transaction. On error the
    /// transaction rolls back and the error is wrapped with `op`.
    pub async fn run_in_tx<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let out = f(&tx)?;
                tx.commit()?;
                Ok(out)
            })
            .await
            .op(op)
    }
}

// ---------------------------------------------------------------------------
// GlobalDb
// ---------------------------------------------------------------------------

/// Handle on the host-wide database (`~/.orc/global.db`): cost telemetry,
/// aggregates, and budgets.
#[derive(Clone)]
pub struct GlobalDb {
    conn: Connection,
}

impl GlobalDb {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await.op("open global db")?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await.op("open global db")?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            apply_pragmas(conn)?;
            apply_migrations(conn, GLOBAL_FAMILY, &global_migrations())?;
            Ok(())
        })
        .await
        .op("migrate global db")?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> Connection {
        self.conn.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
