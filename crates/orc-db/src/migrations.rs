//! Ordered, idempotent schema migrations for both databases.
//!
//! Applied versions are recorded in `schema_migrations`; re-running a family
//! applies nothing. Migrations are additive and must preserve existing rows
//! (the migration tests pin that contract).

use rusqlite::Connection;

pub const PROJECT_FAMILY: &str = "project";
pub const GLOBAL_FAMILY: &str = "global";

#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

// ---------------------------------------------------------------------------
// Project schema
// ---------------------------------------------------------------------------

const PROJECT_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "tasks",
        sql: "
            CREATE TABLE tasks (
                id             TEXT PRIMARY KEY,
                title          TEXT NOT NULL,
                description    TEXT,
                status         TEXT NOT NULL,
                weight         TEXT NOT NULL,
                category       TEXT NOT NULL,
                branch         TEXT UNIQUE,
                current_phase  TEXT,
                session_model  TEXT,
                created_at     TEXT NOT NULL,
                updated_at     TEXT NOT NULL,
                completed_at   TEXT,
                initiative_id  TEXT
            );
            CREATE INDEX idx_tasks_status ON tasks(status);
            CREATE INDEX idx_tasks_initiative ON tasks(initiative_id);

            CREATE TABLE task_counter (
                id      INTEGER PRIMARY KEY CHECK (id = 1),
                next_id INTEGER NOT NULL
            );
            INSERT INTO task_counter (id, next_id) VALUES (1, 1);
        ",
    },
    Migration {
        version: 2,
        name: "phases",
        sql: "
            CREATE TABLE phases (
                task_id      TEXT NOT NULL,
                phase        TEXT NOT NULL,
                status       TEXT NOT NULL,
                started_at   TEXT,
                completed_at TEXT,
                iterations   INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (task_id, phase)
            );

            CREATE TABLE iterations (
                task_id      TEXT NOT NULL,
                phase        TEXT NOT NULL,
                seq          INTEGER NOT NULL,
                prompt_ref   TEXT,
                response_ref TEXT,
                started_at   TEXT NOT NULL,
                ended_at     TEXT,
                outcome      TEXT,
                PRIMARY KEY (task_id, phase, seq)
            );

            CREATE TABLE gate_decisions (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id    TEXT NOT NULL,
                phase      TEXT NOT NULL,
                gate_type  TEXT NOT NULL,
                approved   INTEGER NOT NULL,
                rationale  TEXT,
                decided_by TEXT,
                decided_at TEXT NOT NULL
            );
            CREATE INDEX idx_gates_task_phase
                ON gate_decisions(task_id, phase, decided_at, id);
        ",
    },
    Migration {
        version: 3,
        name: "transcripts",
        sql: "
            CREATE TABLE transcripts (
                id                    INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id               TEXT NOT NULL,
                phase                 TEXT NOT NULL,
                session_id            TEXT NOT NULL,
                workflow_run_id       TEXT,
                message_uuid          TEXT NOT NULL UNIQUE,
                parent_uuid           TEXT,
                kind                  TEXT NOT NULL,
                role                  TEXT,
                content               TEXT NOT NULL,
                model                 TEXT,
                input_tokens          INTEGER NOT NULL DEFAULT 0,
                output_tokens         INTEGER NOT NULL DEFAULT 0,
                cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
                cache_read_tokens     INTEGER NOT NULL DEFAULT 0,
                tool_calls            TEXT,
                tool_results          TEXT,
                timestamp             INTEGER NOT NULL
            );
            CREATE INDEX idx_transcripts_task ON transcripts(task_id, timestamp, id);
            CREATE INDEX idx_transcripts_task_phase ON transcripts(task_id, phase);

            CREATE TABLE todo_snapshots (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id      TEXT NOT NULL,
                phase        TEXT NOT NULL,
                message_uuid TEXT,
                items        TEXT NOT NULL,
                timestamp    TEXT NOT NULL
            );
            CREATE INDEX idx_todo_task ON todo_snapshots(task_id, id);
        ",
    },
    Migration {
        version: 4,
        name: "queues",
        sql: "
            CREATE TABLE subtask_queue (
                id              TEXT PRIMARY KEY,
                parent_task_id  TEXT NOT NULL,
                title           TEXT NOT NULL,
                description     TEXT,
                proposed_by     TEXT,
                proposed_at     TEXT NOT NULL,
                status          TEXT NOT NULL,
                approved_by     TEXT,
                approved_at     TEXT,
                rejected_reason TEXT,
                created_task_id TEXT
            );
            CREATE INDEX idx_subtasks_parent ON subtask_queue(parent_task_id, status);

            CREATE TABLE knowledge_queue (
                id           TEXT PRIMARY KEY,
                kind         TEXT NOT NULL,
                name         TEXT NOT NULL,
                description  TEXT NOT NULL,
                scope        TEXT NOT NULL,
                source_task  TEXT,
                status       TEXT NOT NULL,
                proposed_at  TEXT NOT NULL,
                approved_at  TEXT,
                validated_at TEXT,
                validated_by TEXT
            );
            CREATE INDEX idx_knowledge_status ON knowledge_queue(status);

            CREATE TABLE constitution_checks (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id    TEXT NOT NULL,
                phase      TEXT NOT NULL,
                passed     INTEGER NOT NULL,
                violations TEXT NOT NULL,
                checked_at TEXT NOT NULL
            );
            CREATE INDEX idx_constitution_task
                ON constitution_checks(task_id, phase, id);
        ",
    },
    Migration {
        version: 5,
        name: "phase_agents",
        sql: "
            CREATE TABLE agents (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL,
                prompt      TEXT NOT NULL,
                tools       TEXT NOT NULL,
                model       TEXT,
                is_builtin  INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE phase_templates (
                id            TEXT PRIMARY KEY,
                name          TEXT NOT NULL,
                prompt_source TEXT NOT NULL,
                prompt_path   TEXT
            );

            CREATE TABLE phase_agents (
                id                TEXT PRIMARY KEY,
                phase_template_id TEXT NOT NULL,
                agent_id          TEXT NOT NULL,
                sequence          INTEGER NOT NULL,
                role              TEXT,
                weight_filter     TEXT,
                is_builtin        INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX idx_phase_agents_template
                ON phase_agents(phase_template_id, sequence, agent_id);
        ",
    },
    Migration {
        version: 6,
        name: "project_languages",
        sql: "
            CREATE TABLE project_languages (
                language      TEXT NOT NULL,
                root_path     TEXT NOT NULL,
                is_primary    INTEGER NOT NULL DEFAULT 0,
                frameworks    TEXT NOT NULL,
                build_tool    TEXT,
                test_command  TEXT,
                lint_command  TEXT,
                build_command TEXT,
                detected_at   TEXT NOT NULL,
                PRIMARY KEY (language, root_path)
            );
        ",
    },
    Migration {
        version: 7,
        name: "initiative_projection",
        sql: "
            CREATE TABLE initiatives (
                id            TEXT PRIMARY KEY,
                version       INTEGER NOT NULL,
                title         TEXT NOT NULL,
                status        TEXT NOT NULL,
                owner_initials TEXT,
                owner_display  TEXT,
                owner_email    TEXT,
                vision        TEXT,
                branch_base   TEXT,
                branch_prefix TEXT,
                merge_status  TEXT NOT NULL DEFAULT '',
                merge_commit  TEXT,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );

            CREATE TABLE initiative_decisions (
                initiative_id TEXT NOT NULL,
                id            TEXT NOT NULL,
                date          TEXT NOT NULL,
                decided_by    TEXT NOT NULL,
                decision      TEXT NOT NULL,
                rationale     TEXT,
                PRIMARY KEY (initiative_id, id)
            );

            CREATE TABLE initiative_tasks (
                initiative_id TEXT NOT NULL,
                task_id       TEXT NOT NULL,
                title         TEXT NOT NULL,
                depends_on    TEXT NOT NULL,
                status        TEXT NOT NULL,
                PRIMARY KEY (initiative_id, task_id)
            );

            CREATE TABLE initiative_blockers (
                initiative_id TEXT NOT NULL,
                blocked_by    TEXT NOT NULL,
                PRIMARY KEY (initiative_id, blocked_by)
            );
        ",
    },
];

/// FTS index over transcript content; only applied when the SQLite build
/// supports FTS5 (probed at open).
const PROJECT_FTS_MIGRATION: Migration = Migration {
    version: 8,
    name: "transcripts_fts",
    sql: "
        CREATE VIRTUAL TABLE transcripts_fts
            USING fts5(content, content='transcripts', content_rowid='id');

        CREATE TRIGGER transcripts_ai AFTER INSERT ON transcripts BEGIN
            INSERT INTO transcripts_fts(rowid, content)
                VALUES (new.id, new.content);
        END;
        CREATE TRIGGER transcripts_ad AFTER DELETE ON transcripts BEGIN
            INSERT INTO transcripts_fts(transcripts_fts, rowid, content)
                VALUES ('delete', old.id, old.content);
        END;
        CREATE TRIGGER transcripts_au AFTER UPDATE ON transcripts BEGIN
            INSERT INTO transcripts_fts(transcripts_fts, rowid, content)
                VALUES ('delete', old.id, old.content);
            INSERT INTO transcripts_fts(rowid, content)
                VALUES (new.id, new.content);
        END;
    ",
};

// ---------------------------------------------------------------------------
// Global schema
// ---------------------------------------------------------------------------

const GLOBAL_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "cost_log",
        sql: "
            CREATE TABLE cost_log (
                id                    INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id            TEXT NOT NULL,
                task_id               TEXT NOT NULL,
                phase                 TEXT NOT NULL,
                iteration             INTEGER,
                cost_usd              REAL NOT NULL,
                input_tokens          INTEGER NOT NULL DEFAULT 0,
                output_tokens         INTEGER NOT NULL DEFAULT 0,
                cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
                cache_read_tokens     INTEGER NOT NULL DEFAULT 0,
                total_tokens          INTEGER NOT NULL DEFAULT 0,
                initiative_id         TEXT,
                duration_ms           INTEGER NOT NULL DEFAULT 0,
                timestamp             INTEGER NOT NULL
            );
            CREATE INDEX idx_cost_project_ts ON cost_log(project_id, timestamp);

            CREATE TABLE cost_budgets (
                project_id              TEXT PRIMARY KEY,
                monthly_limit_usd       REAL NOT NULL,
                alert_threshold_percent REAL NOT NULL,
                current_month           TEXT NOT NULL,
                current_month_spent     REAL NOT NULL DEFAULT 0
            );
        ",
    },
    // Additive: pre-existing cost rows keep their data and read back with
    // an empty model.
    Migration {
        version: 2,
        name: "cost_log_model",
        sql: "ALTER TABLE cost_log ADD COLUMN model TEXT NOT NULL DEFAULT '';",
    },
    Migration {
        version: 3,
        name: "cost_aggregates",
        sql: "
            CREATE TABLE cost_aggregates (
                project_id            TEXT NOT NULL,
                model                 TEXT NOT NULL,
                phase                 TEXT NOT NULL,
                date                  TEXT NOT NULL,
                cost_usd              REAL NOT NULL DEFAULT 0,
                input_tokens          INTEGER NOT NULL DEFAULT 0,
                output_tokens         INTEGER NOT NULL DEFAULT 0,
                cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
                cache_read_tokens     INTEGER NOT NULL DEFAULT 0,
                total_tokens          INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (project_id, model, phase, date)
            );
        ",
    },
];

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub fn project_migrations(fts: bool) -> Vec<Migration> {
    let mut all = PROJECT_MIGRATIONS.to_vec();
    if fts {
        all.push(PROJECT_FTS_MIGRATION);
    }
    all
}

pub fn global_migrations() -> Vec<Migration> {
    GLOBAL_MIGRATIONS.to_vec()
}

/// Apply every migration in `migrations` not yet recorded for `family`.
/// Returns the number applied. Safe to call repeatedly.
pub fn apply_migrations(
    conn: &mut Connection,
    family: &str,
    migrations: &[Migration],
) -> rusqlite::Result<usize> {
    apply_migrations_up_to(conn, family, migrations, i64::MAX)
}

/// Apply migrations with `version <= max_version`. Exposed so tests can
/// verify that later migrations preserve rows written under earlier schemas.
pub fn apply_migrations_up_to(
    conn: &mut Connection,
    family: &str,
    migrations: &[Migration],
    max_version: i64,
) -> rusqlite::Result<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            family     TEXT NOT NULL,
            version    INTEGER NOT NULL,
            name       TEXT NOT NULL,
            applied_at TEXT NOT NULL,
            PRIMARY KEY (family, version)
        );",
    )?;

    let mut applied = 0usize;
    for migration in migrations {
        if migration.version > max_version {
            continue;
        }
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE family = ?1 AND version = ?2)",
            rusqlite::params![family, migration.version],
            |row| row.get(0),
        )?;
        if exists {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (family, version, name, applied_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                family,
                migration.version,
                migration.name,
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;
        tracing::debug!(family, version = migration.version, name = migration.name, "migration applied");
        applied += 1;
    }
    Ok(applied)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_ordered_and_unique() {
        for family in [project_migrations(true), global_migrations()] {
            let versions: Vec<i64> = family.iter().map(|m| m.version).collect();
            let mut sorted = versions.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(versions, sorted, "versions must be ascending and unique");
        }
    }

    #[test]
    fn apply_twice_is_noop() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrations = global_migrations();
        let first = apply_migrations(&mut conn, GLOBAL_FAMILY, &migrations).unwrap();
        assert_eq!(first, migrations.len());
        let second = apply_migrations(&mut conn, GLOBAL_FAMILY, &migrations).unwrap();
        assert_eq!(second, 0);
    }

    #[test]
    fn families_are_independent() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn, GLOBAL_FAMILY, &global_migrations()).unwrap();
        // Project migrations still apply fully on the same connection.
        let applied =
            apply_migrations(&mut conn, PROJECT_FAMILY, &project_migrations(false)).unwrap();
        assert_eq!(applied, project_migrations(false).len());
    }
}
