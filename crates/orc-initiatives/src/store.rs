//! Hybrid file + database initiative store.
//!
//! The YAML file under `<base>/<INIT-id>/initiative.yaml` is authoritative.
//! Saves write the file first (atomically, serialized by a store-wide
//! mutex), then sync the database projection best-effort; a projection
//! failure is logged, never surfaced. Explicit repairs go both directions:
//! `rebuild_index` (DB from files) and `recover_from_db` (file from DB).

use std::path::{Path, PathBuf};

use chrono::Utc;
use orc_core::git::{commit_paths, GitError};
use orc_db::ProjectDb;
use tokio::sync::Mutex;

use crate::types::{
    validate_id, Decision, Initiative, InitiativeStatus, MergeStatus, Owner, TaskRef,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum InitiativeError {
    #[error("invalid initiative id: {0}")]
    InvalidId(String),
    #[error("initiative not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("projection error: {0}")]
    Store(#[from] orc_db::StoreError),
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("no projection database configured")]
    NoProjection,
}

pub type Result<T> = std::result::Result<T, InitiativeError>;

// ---------------------------------------------------------------------------
// InitiativeStore
// ---------------------------------------------------------------------------

/// Git auto-commit settings for initiative files.
#[derive(Debug, Clone)]
pub struct GitCommitSettings {
    pub repo_root: PathBuf,
    pub commit_prefix: String,
}

pub struct InitiativeStore {
    base_dir: PathBuf,
    db: Option<ProjectDb>,
    git: Option<GitCommitSettings>,
    /// Serializes YAML writes across tasks sharing this store.
    write_lock: Mutex<()>,
}

impl InitiativeStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            db: None,
            git: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Attach the project database used for the query projection.
    pub fn with_projection(mut self, db: ProjectDb) -> Self {
        self.db = Some(db);
        self
    }

    /// Commit initiative files after save/delete.
    pub fn with_git(mut self, settings: GitCommitSettings) -> Self {
        self.git = Some(settings);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn initiative_dir(&self, id: &str) -> PathBuf {
        self.base_dir.join(id)
    }

    fn yaml_path(&self, id: &str) -> PathBuf {
        self.initiative_dir(id).join("initiative.yaml")
    }

    /// Seed a new draft after validating the id.
    pub fn new_initiative(&self, id: &str, title: &str) -> Result<Initiative> {
        validate_id(id).map_err(InitiativeError::InvalidId)?;
        Ok(Initiative::new(id, title))
    }

    // -----------------------------------------------------------------------
    // Save / load / delete
    // -----------------------------------------------------------------------

    /// Persist to YAML (authoritative), then best-effort sync the projection
    /// and optionally commit the file. Bumps `updated_at`.
    pub async fn save(&self, initiative: &mut Initiative) -> Result<()> {
        validate_id(&initiative.id).map_err(InitiativeError::InvalidId)?;
        initiative.updated_at = Utc::now();

        let yaml = serde_yaml::to_string(initiative)?;
        let path = self.yaml_path(&initiative.id);
        {
            let _guard = self.write_lock.lock().await;
            write_atomic(&path, &yaml).await?;
        }

        if let Err(e) = self.sync_projection(initiative).await {
            tracing::warn!(
                initiative = %initiative.id,
                error = %e,
                "projection sync failed after save"
            );
        }

        if let Some(git) = &self.git {
            let message = format!(
                "{} initiative {}: save - {}",
                git.commit_prefix, initiative.id, initiative.title
            );
            commit_paths(&git.repo_root, &[&path.display().to_string()], &message).await?;
        }
        Ok(())
    }

    /// Read the YAML file only; the projection never serves loads.
    pub async fn load(&self, id: &str) -> Result<Initiative> {
        validate_id(id).map_err(InitiativeError::InvalidId)?;
        let path = self.yaml_path(id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(InitiativeError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Remove the directory tree, then the projection, then commit.
    /// Deleting a nonexistent initiative is not an error.
    pub async fn delete(&self, id: &str) -> Result<()> {
        validate_id(id).map_err(InitiativeError::InvalidId)?;
        let dir = self.initiative_dir(id);
        {
            let _guard = self.write_lock.lock().await;
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Err(e) = self.delete_projection(id).await {
            tracing::warn!(initiative = %id, error = %e, "projection delete failed");
        }

        if let Some(git) = &self.git {
            let message = format!("{} initiative {}: delete", git.commit_prefix, id);
            commit_paths(&git.repo_root, &[&dir.display().to_string()], &message).await?;
        }
        Ok(())
    }

    /// All initiatives on disk, sorted by id. A directory whose YAML fails
    /// to parse is skipped with a warning rather than aborting the scan.
    pub async fn list(&self) -> Result<Vec<Initiative>> {
        let mut out = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let yaml_path = entry.path().join("initiative.yaml");
            let text = match tokio::fs::read_to_string(&yaml_path).await {
                Ok(text) => text,
                Err(_) => continue,
            };
            match serde_yaml::from_str::<Initiative>(&text) {
                Ok(initiative) => out.push(initiative),
                Err(e) => {
                    tracing::warn!(path = %yaml_path.display(), error = %e, "skipping malformed initiative yaml");
                }
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Repair
    // -----------------------------------------------------------------------

    /// Re-project every YAML file into the database. Returns how many were
    /// synced.
    pub async fn rebuild_index(&self) -> Result<usize> {
        let initiatives = self.list().await?;
        let mut synced = 0;
        for initiative in &initiatives {
            self.sync_projection(initiative).await?;
            synced += 1;
        }
        Ok(synced)
    }

    /// Reconstruct the YAML file from the projection when the file side is
    /// missing or lost.
    pub async fn recover_from_db(&self, id: &str) -> Result<Initiative> {
        validate_id(id).map_err(InitiativeError::InvalidId)?;
        let initiative = self.load_projection(id).await?;
        let yaml = serde_yaml::to_string(&initiative)?;
        let _guard = self.write_lock.lock().await;
        write_atomic(&self.yaml_path(id), &yaml).await?;
        Ok(initiative)
    }

    /// Bring the file side into agreement with the DB. Returns whether a
    /// repair was needed.
    pub async fn ensure_yaml_exists(&self, id: &str) -> Result<bool> {
        validate_id(id).map_err(InitiativeError::InvalidId)?;
        if self.yaml_path(id).exists() {
            return Ok(false);
        }
        self.recover_from_db(id).await?;
        tracing::info!(initiative = %id, "recovered initiative yaml from projection");
        Ok(true)
    }

    /// Bring the DB side into agreement with the file. Returns whether a
    /// repair was needed.
    pub async fn ensure_db_exists(&self, id: &str) -> Result<bool> {
        validate_id(id).map_err(InitiativeError::InvalidId)?;
        if self.projection_has(id).await? {
            return Ok(false);
        }
        let initiative = self.load(id).await?;
        self.sync_projection(&initiative).await?;
        tracing::info!(initiative = %id, "rebuilt initiative projection from yaml");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Projection
    // -----------------------------------------------------------------------

    async fn sync_projection(&self, initiative: &Initiative) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(()); // projection optional
        };
        let i = initiative.clone();
        db.run_in_tx("sync initiative projection", move |tx| {
            tx.execute(
                "INSERT INTO initiatives
                    (id, version, title, status, owner_initials, owner_display, owner_email,
                     vision, branch_base, branch_prefix, merge_status, merge_commit,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(id) DO UPDATE SET
                    version = excluded.version,
                    title = excluded.title,
                    status = excluded.status,
                    owner_initials = excluded.owner_initials,
                    owner_display = excluded.owner_display,
                    owner_email = excluded.owner_email,
                    vision = excluded.vision,
                    branch_base = excluded.branch_base,
                    branch_prefix = excluded.branch_prefix,
                    merge_status = excluded.merge_status,
                    merge_commit = excluded.merge_commit,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    i.id,
                    i.version,
                    i.title,
                    status_to_sql(&i.status),
                    i.owner.initials,
                    i.owner.display,
                    i.owner.email,
                    i.vision,
                    i.branch_base,
                    i.branch_prefix,
                    i.merge_status.as_str(),
                    i.merge_commit,
                    i.created_at.to_rfc3339(),
                    i.updated_at.to_rfc3339(),
                ],
            )?;

            // Children are replaced wholesale inside the same transaction.
            tx.execute(
                "DELETE FROM initiative_decisions WHERE initiative_id = ?1",
                rusqlite::params![i.id],
            )?;
            for d in &i.decisions {
                tx.execute(
                    "INSERT INTO initiative_decisions
                        (initiative_id, id, date, decided_by, decision, rationale)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![i.id, d.id, d.date, d.by, d.decision, d.rationale],
                )?;
            }

            tx.execute(
                "DELETE FROM initiative_tasks WHERE initiative_id = ?1",
                rusqlite::params![i.id],
            )?;
            for t in &i.tasks {
                tx.execute(
                    "INSERT INTO initiative_tasks
                        (initiative_id, task_id, title, depends_on, status)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        i.id,
                        t.id,
                        t.title,
                        serde_json::to_string(&t.depends_on).expect("serialize depends_on"),
                        t.status,
                    ],
                )?;
            }

            tx.execute(
                "DELETE FROM initiative_blockers WHERE initiative_id = ?1",
                rusqlite::params![i.id],
            )?;
            for blocker in &i.blocked_by {
                tx.execute(
                    "INSERT INTO initiative_blockers (initiative_id, blocked_by) VALUES (?1, ?2)",
                    rusqlite::params![i.id, blocker],
                )?;
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn delete_projection(&self, id: &str) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let id = id.to_string();
        db.run_in_tx("delete initiative projection", move |tx| {
            tx.execute("DELETE FROM initiative_blockers WHERE initiative_id = ?1", rusqlite::params![id])?;
            tx.execute("DELETE FROM initiative_tasks WHERE initiative_id = ?1", rusqlite::params![id])?;
            tx.execute("DELETE FROM initiative_decisions WHERE initiative_id = ?1", rusqlite::params![id])?;
            tx.execute("DELETE FROM initiatives WHERE id = ?1", rusqlite::params![id])?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn projection_has(&self, id: &str) -> Result<bool> {
        let Some(db) = &self.db else {
            return Err(InitiativeError::NoProjection);
        };
        let id = id.to_string();
        let exists = db
            .run_in_tx("check initiative projection", move |tx| {
                tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM initiatives WHERE id = ?1)",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
            })
            .await?;
        Ok(exists)
    }

    async fn load_projection(&self, id: &str) -> Result<Initiative> {
        let Some(db) = &self.db else {
            return Err(InitiativeError::NoProjection);
        };
        let id_owned = id.to_string();
        let found = db
            .run_in_tx("load initiative projection", move |tx| {
                let mut stmt = tx.prepare(
                    "SELECT id, version, title, status, owner_initials, owner_display,
                            owner_email, vision, branch_base, branch_prefix, merge_status,
                            merge_commit, created_at, updated_at
                     FROM initiatives WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_owned])?;
                let Some(row) = rows.next()? else {
                    return Ok(None);
                };
                let merge_raw: String = row.get(10)?;
                let status_raw: String = row.get(3)?;
                let mut initiative = Initiative {
                    version: row.get(1)?,
                    id: row.get(0)?,
                    title: row.get(2)?,
                    status: status_from_sql(&status_raw),
                    owner: Owner {
                        initials: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                        display: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                        email: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                    },
                    vision: row.get(7)?,
                    decisions: Vec::new(),
                    tasks: Vec::new(),
                    blocked_by: Vec::new(),
                    blocks: Vec::new(),
                    branch_base: row.get(8)?,
                    branch_prefix: row.get(9)?,
                    merge_status: MergeStatus::parse(&merge_raw),
                    merge_commit: row.get(11)?,
                    created_at: parse_rfc3339(&row.get::<_, String>(12)?),
                    updated_at: parse_rfc3339(&row.get::<_, String>(13)?),
                };
                drop(rows);
                drop(stmt);

                let mut stmt = tx.prepare(
                    "SELECT id, date, decided_by, decision, rationale
                     FROM initiative_decisions WHERE initiative_id = ?1 ORDER BY id",
                )?;
                let mut rows = stmt.query(rusqlite::params![initiative.id])?;
                while let Some(row) = rows.next()? {
                    initiative.decisions.push(Decision {
                        id: row.get(0)?,
                        date: row.get(1)?,
                        by: row.get(2)?,
                        decision: row.get(3)?,
                        rationale: row.get(4)?,
                    });
                }
                drop(rows);
                drop(stmt);

                let mut stmt = tx.prepare(
                    "SELECT task_id, title, depends_on, status
                     FROM initiative_tasks WHERE initiative_id = ?1 ORDER BY task_id",
                )?;
                let mut rows = stmt.query(rusqlite::params![initiative.id])?;
                while let Some(row) = rows.next()? {
                    let depends_raw: String = row.get(2)?;
                    initiative.tasks.push(TaskRef {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        depends_on: serde_json::from_str(&depends_raw).unwrap_or_default(),
                        status: row.get(3)?,
                    });
                }
                drop(rows);
                drop(stmt);

                let mut stmt = tx.prepare(
                    "SELECT blocked_by FROM initiative_blockers
                     WHERE initiative_id = ?1 ORDER BY blocked_by",
                )?;
                let mut rows = stmt.query(rusqlite::params![initiative.id])?;
                while let Some(row) = rows.next()? {
                    initiative.blocked_by.push(row.get(0)?);
                }

                Ok(Some(initiative))
            })
            .await?;
        found.ok_or_else(|| InitiativeError::NotFound(id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Write via a temp file in the same directory, then rename over the target.
/// Parent directories are created; file mode is 0644 on unix.
async fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let parent = path.parent().expect("initiative yaml has a parent");
    tokio::fs::create_dir_all(parent).await?;
    let tmp = path.with_extension("yaml.tmp");
    tokio::fs::write(&tmp, content).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644)).await?;
    }
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn status_to_sql(status: &InitiativeStatus) -> String {
    serde_json::to_string(status)
        .expect("serialize status")
        .trim_matches('"')
        .to_string()
}

fn status_from_sql(raw: &str) -> InitiativeStatus {
    serde_json::from_str(&format!("\"{raw}\"")).unwrap_or_default()
}

fn parse_rfc3339(raw: &str) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
