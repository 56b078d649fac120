//! Task-shaped persistence: tasks, phases, iterations, gate decisions, the
//! subtask and knowledge queues, constitution checks, and detected project
//! languages.

use chrono::{DateTime, Utc};
use orc_core::types::{
    task_id, ConstitutionCheck, GateDecision, GateType, Iteration, IterationOutcome,
    KnowledgeEntry, KnowledgeStatus, PhaseState, PhaseStatus, ProjectLanguage, Subtask,
    SubtaskStatus, Task, TaskStatus,
};

use crate::sql_util::{enum_from_sql, enum_to_sql, opt_ts_from_sql, ts_from_sql, ts_to_sql};
use crate::{DbResultExt, ProjectDb, Result, StoreError};

const TASK_COLUMNS: &str = "id, title, description, status, weight, category, branch,
     current_phase, session_model, created_at, updated_at, completed_at, initiative_id";

/// Store over the project database for everything task-lifecycle shaped.
#[derive(Clone)]
pub struct TaskStore {
    db: ProjectDb,
}

impl TaskStore {
    pub fn new(db: ProjectDb) -> Self {
        Self { db }
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Create a task, allocating the next `TASK-<n>` id atomically.
    pub async fn create_task(
        &self,
        title: impl Into<String>,
        description: Option<String>,
        weight: orc_core::types::TaskWeight,
        category: orc_core::types::TaskCategory,
    ) -> Result<Task> {
        let title = title.into();
        self.db
            .run_in_tx("create task", move |tx| {
                let n: u64 = tx.query_row(
                    "UPDATE task_counter SET next_id = next_id + 1 WHERE id = 1
                     RETURNING next_id - 1",
                    [],
                    |row| row.get(0),
                )?;
                let mut t = Task::new(task_id(n), title.clone(), weight, category);
                t.description = description.clone();
                tx.execute(
                    "INSERT INTO tasks (id, title, description, status, weight, category,
                        created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        t.id,
                        t.title,
                        t.description,
                        enum_to_sql(&t.status),
                        enum_to_sql(&t.weight),
                        enum_to_sql(&t.category),
                        ts_to_sql(&t.created_at),
                        ts_to_sql(&t.updated_at),
                    ],
                )?;
                Ok(t)
            })
            .await
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let id = id.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"
                ))?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_task(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .op("get task")
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at, id"
                ))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await
            .op("list tasks")
    }

    pub async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let status = enum_to_sql(&status);
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY created_at, id"
                ))?;
                let mut rows = stmt.query(rusqlite::params![status])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await
            .op("list tasks by status")
    }

    /// Persist a status change. `completed_at` is stamped for terminal
    /// statuses and cleared otherwise, keeping the invariant in one place.
    pub async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let id = id.to_string();
        let status_sql = enum_to_sql(&status);
        let now = ts_to_sql(&Utc::now());
        let completed_at = if status.is_terminal() {
            Some(now.clone())
        } else {
            None
        };
        let changed = self
            .db
            .connection()
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE tasks SET status = ?1, updated_at = ?2, completed_at = ?3
                     WHERE id = ?4",
                    rusqlite::params![status_sql, now, completed_at, id],
                )?)
            })
            .await
            .op("update task status")?;
        if changed == 0 {
            return Err(StoreError::Conflict("task"));
        }
        Ok(())
    }

    /// Assign the task's branch. Branches are unique per project; a clash
    /// surfaces as `BranchTaken`.
    pub async fn set_task_branch(&self, id: &str, branch: &str) -> Result<()> {
        let id = id.to_string();
        let branch = branch.to_string();
        let branch_for_err = branch.clone();
        let now = ts_to_sql(&Utc::now());
        let result = self
            .db
            .connection()
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE tasks SET branch = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![branch, now, id],
                )?)
            })
            .await;
        match result {
            Ok(0) => Err(StoreError::Conflict("task")),
            Ok(_) => Ok(()),
            Err(tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _)))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::BranchTaken(branch_for_err))
            }
            Err(source) => Err(StoreError::Db {
                op: "set task branch",
                source,
            }),
        }
    }

    pub async fn set_current_phase(&self, id: &str, phase: Option<&str>) -> Result<()> {
        let id = id.to_string();
        let phase = phase.map(|p| p.to_string());
        let now = ts_to_sql(&Utc::now());
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "UPDATE tasks SET current_phase = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![phase, now, id],
                )?;
                Ok(())
            })
            .await
            .op("set current phase")
    }

    pub async fn set_initiative(&self, id: &str, initiative_id: Option<&str>) -> Result<()> {
        let id = id.to_string();
        let initiative_id = crate::empty_to_null(initiative_id.map(|s| s.to_string()));
        let now = ts_to_sql(&Utc::now());
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "UPDATE tasks SET initiative_id = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![initiative_id, now, id],
                )?;
                Ok(())
            })
            .await
            .op("set task initiative")
    }

    pub async fn set_session_model(&self, id: &str, model: &str) -> Result<()> {
        let id = id.to_string();
        let model = model.to_string();
        let now = ts_to_sql(&Utc::now());
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "UPDATE tasks SET session_model = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![model, now, id],
                )?;
                Ok(())
            })
            .await
            .op("set session model")
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    pub async fn upsert_phase(&self, state: &PhaseState) -> Result<()> {
        let task_id = state.task_id.clone();
        let phase = state.phase.clone();
        let status = enum_to_sql(&state.status);
        let started_at = state.started_at.map(|t| ts_to_sql(&t));
        let completed_at = state.completed_at.map(|t| ts_to_sql(&t));
        let iterations = state.iterations;
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO phases (task_id, phase, status, started_at, completed_at, iterations)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(task_id, phase) DO UPDATE SET
                        status = excluded.status,
                        started_at = excluded.started_at,
                        completed_at = excluded.completed_at,
                        iterations = excluded.iterations",
                    rusqlite::params![task_id, phase, status, started_at, completed_at, iterations],
                )?;
                Ok(())
            })
            .await
            .op("upsert phase")
    }

    pub async fn get_phase(&self, task: &str, phase: &str) -> Result<Option<PhaseState>> {
        let task = task.to_string();
        let phase = phase.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT task_id, phase, status, started_at, completed_at, iterations
                     FROM phases WHERE task_id = ?1 AND phase = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![task, phase])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_phase(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .op("get phase")
    }

    pub async fn list_phases(&self, task: &str) -> Result<Vec<PhaseState>> {
        let task = task.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT task_id, phase, status, started_at, completed_at, iterations
                     FROM phases WHERE task_id = ?1 ORDER BY started_at, phase",
                )?;
                let mut rows = stmt.query(rusqlite::params![task])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_phase(row)?);
                }
                Ok(out)
            })
            .await
            .op("list phases")
    }

    /// Number of phases currently `running` for the task. The engine checks
    /// this is zero before starting a phase (at most one running phase).
    pub async fn running_phase_count(&self, task: &str) -> Result<u32> {
        let task = task.to_string();
        self.db
            .connection()
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM phases WHERE task_id = ?1 AND status = 'running'",
                    rusqlite::params![task],
                    |row| row.get(0),
                )?)
            })
            .await
            .op("running phase count")
    }

    // -----------------------------------------------------------------------
    // Iterations
    // -----------------------------------------------------------------------

    /// Open the next iteration for `(task, phase)`; `seq` starts at 1 and is
    /// monotonic per phase.
    pub async fn start_iteration(
        &self,
        task: &str,
        phase: &str,
        prompt_ref: Option<String>,
    ) -> Result<Iteration> {
        let task = task.to_string();
        let phase = phase.to_string();
        self.db
            .run_in_tx("start iteration", move |tx| {
                let seq: u32 = tx.query_row(
                    "SELECT COALESCE(MAX(seq), 0) + 1 FROM iterations
                     WHERE task_id = ?1 AND phase = ?2",
                    rusqlite::params![task, phase],
                    |row| row.get(0),
                )?;
                let started_at = Utc::now();
                tx.execute(
                    "INSERT INTO iterations (task_id, phase, seq, prompt_ref, started_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![task, phase, seq, prompt_ref, ts_to_sql(&started_at)],
                )?;
                tx.execute(
                    "UPDATE phases SET iterations = ?3 WHERE task_id = ?1 AND phase = ?2",
                    rusqlite::params![task, phase, seq],
                )?;
                Ok(Iteration {
                    task_id: task.clone(),
                    phase: phase.clone(),
                    seq,
                    prompt_ref: prompt_ref.clone(),
                    response_ref: None,
                    started_at,
                    ended_at: None,
                    outcome: None,
                })
            })
            .await
    }

    pub async fn finish_iteration(
        &self,
        task: &str,
        phase: &str,
        seq: u32,
        outcome: IterationOutcome,
        response_ref: Option<String>,
    ) -> Result<()> {
        let task = task.to_string();
        let phase = phase.to_string();
        let outcome = enum_to_sql(&outcome);
        let now = ts_to_sql(&Utc::now());
        let changed = self
            .db
            .connection()
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE iterations SET ended_at = ?1, outcome = ?2, response_ref = ?3
                     WHERE task_id = ?4 AND phase = ?5 AND seq = ?6",
                    rusqlite::params![now, outcome, response_ref, task, phase, seq],
                )?)
            })
            .await
            .op("finish iteration")?;
        if changed == 0 {
            return Err(StoreError::Conflict("iteration"));
        }
        Ok(())
    }

    pub async fn list_iterations(&self, task: &str, phase: &str) -> Result<Vec<Iteration>> {
        let task = task.to_string();
        let phase = phase.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT task_id, phase, seq, prompt_ref, response_ref,
                            started_at, ended_at, outcome
                     FROM iterations WHERE task_id = ?1 AND phase = ?2 ORDER BY seq",
                )?;
                let mut rows = stmt.query(rusqlite::params![task, phase])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let outcome: Option<String> = row.get(7)?;
                    out.push(Iteration {
                        task_id: row.get(0)?,
                        phase: row.get(1)?,
                        seq: row.get(2)?,
                        prompt_ref: row.get(3)?,
                        response_ref: row.get(4)?,
                        started_at: ts_from_sql(&row.get::<_, String>(5)?),
                        ended_at: opt_ts_from_sql(row.get(6)?),
                        outcome: outcome.map(|o| enum_from_sql(&o)),
                    });
                }
                Ok(out)
            })
            .await
            .op("list iterations")
    }

    // -----------------------------------------------------------------------
    // Gate decisions
    // -----------------------------------------------------------------------

    pub async fn record_gate(
        &self,
        task: &str,
        phase: &str,
        gate_type: GateType,
        approved: bool,
        rationale: Option<String>,
        decided_by: Option<String>,
    ) -> Result<GateDecision> {
        let task = task.to_string();
        let phase = phase.to_string();
        let gate_sql = enum_to_sql(&gate_type);
        let decided_at = Utc::now();
        let decided_at_sql = ts_to_sql(&decided_at);
        let rationale_clone = rationale.clone();
        let decided_by_clone = decided_by.clone();
        let id = self
            .db
            .connection()
            .call({
                let task = task.clone();
                let phase = phase.clone();
                move |conn| {
                conn.execute(
                    "INSERT INTO gate_decisions
                        (task_id, phase, gate_type, approved, rationale, decided_by, decided_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        task,
                        phase,
                        gate_sql,
                        approved,
                        rationale_clone,
                        decided_by_clone,
                        decided_at_sql
                    ],
                )?;
                Ok(conn.last_insert_rowid())
                }
            })
            .await
            .op("record gate")?;
        Ok(GateDecision {
            id,
            task_id: task.to_string(),
            phase: phase.to_string(),
            gate_type,
            approved,
            rationale,
            decided_by,
            decided_at,
        })
    }

    /// The latest decision dictates transition eligibility; older ones are
    /// history only.
    pub async fn latest_gate(&self, task: &str, phase: &str) -> Result<Option<GateDecision>> {
        let task = task.to_string();
        let phase = phase.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, task_id, phase, gate_type, approved, rationale, decided_by, decided_at
                     FROM gate_decisions WHERE task_id = ?1 AND phase = ?2
                     ORDER BY decided_at DESC, id DESC LIMIT 1",
                )?;
                let mut rows = stmt.query(rusqlite::params![task, phase])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_gate(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .op("latest gate")
    }

    pub async fn list_gates(&self, task: &str) -> Result<Vec<GateDecision>> {
        let task = task.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, task_id, phase, gate_type, approved, rationale, decided_by, decided_at
                     FROM gate_decisions WHERE task_id = ?1 ORDER BY decided_at, id",
                )?;
                let mut rows = stmt.query(rusqlite::params![task])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_gate(row)?);
                }
                Ok(out)
            })
            .await
            .op("list gates")
    }

    // -----------------------------------------------------------------------
    // Subtask queue
    // -----------------------------------------------------------------------

    pub async fn propose_subtask(&self, subtask: &Subtask) -> Result<()> {
        let s = subtask.clone();
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO subtask_queue
                        (id, parent_task_id, title, description, proposed_by, proposed_at,
                         status, approved_by, approved_at, rejected_reason, created_task_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    rusqlite::params![
                        s.id,
                        s.parent_task_id,
                        s.title,
                        s.description,
                        s.proposed_by,
                        ts_to_sql(&s.proposed_at),
                        enum_to_sql(&s.status),
                        s.approved_by,
                        s.approved_at.map(|t| ts_to_sql(&t)),
                        s.rejected_reason,
                        s.created_task_id,
                    ],
                )?;
                Ok(())
            })
            .await
            .op("propose subtask")
    }

    pub async fn list_subtasks(
        &self,
        parent: &str,
        status: Option<SubtaskStatus>,
    ) -> Result<Vec<Subtask>> {
        let parent = parent.to_string();
        let status = status.map(|s| enum_to_sql(&s));
        self.db
            .connection()
            .call(move |conn| {
                let sql = match status {
                    Some(_) => {
                        "SELECT id, parent_task_id, title, description, proposed_by, proposed_at,
                                status, approved_by, approved_at, rejected_reason, created_task_id
                         FROM subtask_queue WHERE parent_task_id = ?1 AND status = ?2
                         ORDER BY proposed_at, id"
                    }
                    None => {
                        "SELECT id, parent_task_id, title, description, proposed_by, proposed_at,
                                status, approved_by, approved_at, rejected_reason, created_task_id
                         FROM subtask_queue WHERE parent_task_id = ?1
                         ORDER BY proposed_at, id"
                    }
                };
                let mut stmt = conn.prepare(sql)?;
                let mut out = Vec::new();
                let mut rows = match &status {
                    Some(s) => stmt.query(rusqlite::params![parent, s])?,
                    None => stmt.query(rusqlite::params![parent])?,
                };
                while let Some(row) = rows.next()? {
                    out.push(row_to_subtask(row)?);
                }
                Ok(out)
            })
            .await
            .op("list subtasks")
    }

    /// Approve a pending subtask. Only a row still in `pending` is affected;
    /// anything else is a conflict.
    pub async fn approve_subtask(&self, id: &str, by: &str) -> Result<()> {
        let id = id.to_string();
        let by = by.to_string();
        let now = ts_to_sql(&Utc::now());
        let changed = self
            .db
            .connection()
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE subtask_queue
                     SET status = 'approved', approved_by = ?1, approved_at = ?2
                     WHERE id = ?3 AND status = 'pending'",
                    rusqlite::params![by, now, id],
                )?)
            })
            .await
            .op("approve subtask")?;
        if changed == 0 {
            return Err(StoreError::Conflict("subtask"));
        }
        Ok(())
    }

    pub async fn reject_subtask(&self, id: &str, reason: &str) -> Result<()> {
        let id = id.to_string();
        let reason = reason.to_string();
        let changed = self
            .db
            .connection()
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE subtask_queue SET status = 'rejected', rejected_reason = ?1
                     WHERE id = ?2 AND status = 'pending'",
                    rusqlite::params![reason, id],
                )?)
            })
            .await
            .op("reject subtask")?;
        if changed == 0 {
            return Err(StoreError::Conflict("subtask"));
        }
        Ok(())
    }

    /// Record the task created from an approved subtask.
    pub async fn link_created_task(&self, id: &str, created_task_id: &str) -> Result<()> {
        let id = id.to_string();
        let created = created_task_id.to_string();
        let changed = self
            .db
            .connection()
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE subtask_queue SET created_task_id = ?1
                     WHERE id = ?2 AND status = 'approved'",
                    rusqlite::params![created, id],
                )?)
            })
            .await
            .op("link created task")?;
        if changed == 0 {
            return Err(StoreError::Conflict("subtask"));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Knowledge queue
    // -----------------------------------------------------------------------

    pub async fn propose_knowledge(&self, entry: &KnowledgeEntry) -> Result<()> {
        let e = entry.clone();
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO knowledge_queue
                        (id, kind, name, description, scope, source_task, status,
                         proposed_at, approved_at, validated_at, validated_by)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    rusqlite::params![
                        e.id,
                        enum_to_sql(&e.kind),
                        e.name,
                        e.description,
                        enum_to_sql(&e.scope),
                        e.source_task,
                        enum_to_sql(&e.status),
                        ts_to_sql(&e.proposed_at),
                        e.approved_at.map(|t| ts_to_sql(&t)),
                        e.validated_at.map(|t| ts_to_sql(&t)),
                        e.validated_by,
                    ],
                )?;
                Ok(())
            })
            .await
            .op("propose knowledge")
    }

    pub async fn list_knowledge(&self, status: Option<KnowledgeStatus>) -> Result<Vec<KnowledgeEntry>> {
        let status = status.map(|s| enum_to_sql(&s));
        self.db
            .connection()
            .call(move |conn| {
                let sql = match status {
                    Some(_) => {
                        "SELECT id, kind, name, description, scope, source_task, status,
                                proposed_at, approved_at, validated_at, validated_by
                         FROM knowledge_queue WHERE status = ?1 ORDER BY proposed_at, id"
                    }
                    None => {
                        "SELECT id, kind, name, description, scope, source_task, status,
                                proposed_at, approved_at, validated_at, validated_by
                         FROM knowledge_queue ORDER BY proposed_at, id"
                    }
                };
                let mut stmt = conn.prepare(sql)?;
                let mut rows = match &status {
                    Some(s) => stmt.query(rusqlite::params![s])?,
                    None => stmt.query([])?,
                };
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_knowledge(row)?);
                }
                Ok(out)
            })
            .await
            .op("list knowledge")
    }

    /// Bulk-approve every pending entry, stamping `approved_at`. Returns the
    /// number approved.
    pub async fn approve_all_pending_knowledge(&self, by: &str) -> Result<usize> {
        let by = by.to_string();
        let now = ts_to_sql(&Utc::now());
        self.db
            .connection()
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE knowledge_queue
                     SET status = 'approved', approved_at = ?1, validated_by = ?2
                     WHERE status = 'pending'",
                    rusqlite::params![now, by],
                )?)
            })
            .await
            .op("approve all pending knowledge")
    }

    /// Re-validate an approved entry, resetting its staleness clock.
    pub async fn validate_knowledge(&self, id: &str, by: &str) -> Result<()> {
        let id = id.to_string();
        let by = by.to_string();
        let now = ts_to_sql(&Utc::now());
        let changed = self
            .db
            .connection()
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE knowledge_queue SET validated_at = ?1, validated_by = ?2
                     WHERE id = ?3 AND status = 'approved'",
                    rusqlite::params![now, by, id],
                )?)
            })
            .await
            .op("validate knowledge")?;
        if changed == 0 {
            return Err(StoreError::Conflict("knowledge entry"));
        }
        Ok(())
    }

    /// Approved entries whose last validation (or approval) predates the
    /// staleness window.
    pub async fn stale_knowledge(
        &self,
        staleness_days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<KnowledgeEntry>> {
        let approved = self.list_knowledge(Some(KnowledgeStatus::Approved)).await?;
        Ok(approved
            .into_iter()
            .filter(|e| e.is_stale(staleness_days, now))
            .collect())
    }

    // -----------------------------------------------------------------------
    // Constitution checks
    // -----------------------------------------------------------------------

    pub async fn record_constitution_check(
        &self,
        task: &str,
        phase: &str,
        passed: bool,
        violations: Vec<String>,
    ) -> Result<ConstitutionCheck> {
        let task = task.to_string();
        let phase = phase.to_string();
        let violations_json =
            serde_json::to_string(&violations).unwrap_or_else(|_| "[]".to_string());
        let checked_at = Utc::now();
        let checked_at_sql = ts_to_sql(&checked_at);
        let id = self
            .db
            .connection()
            .call({
                let task = task.clone();
                let phase = phase.clone();
                move |conn| {
                conn.execute(
                    "INSERT INTO constitution_checks (task_id, phase, passed, violations, checked_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![task, phase, passed, violations_json, checked_at_sql],
                )?;
                Ok(conn.last_insert_rowid())
                }
            })
            .await
            .op("record constitution check")?;
        Ok(ConstitutionCheck {
            id,
            task_id: task.to_string(),
            phase: phase.to_string(),
            passed,
            violations,
            checked_at,
        })
    }

    /// Latest check for `(task, phase)`; absence is `Ok(None)`, not an error.
    pub async fn latest_constitution_check(
        &self,
        task: &str,
        phase: &str,
    ) -> Result<Option<ConstitutionCheck>> {
        let task = task.to_string();
        let phase = phase.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, task_id, phase, passed, violations, checked_at
                     FROM constitution_checks WHERE task_id = ?1 AND phase = ?2
                     ORDER BY id DESC LIMIT 1",
                )?;
                let mut rows = stmt.query(rusqlite::params![task, phase])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_constitution_check(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .op("latest constitution check")
    }

    // -----------------------------------------------------------------------
    // Project languages
    // -----------------------------------------------------------------------

    /// Upsert a detected language root. Setting a new primary clears the
    /// flag on every other row first.
    pub async fn save_project_language(&self, lang: &ProjectLanguage) -> Result<()> {
        let l = lang.clone();
        self.db
            .run_in_tx("save project language", move |tx| {
                if l.is_primary {
                    tx.execute("UPDATE project_languages SET is_primary = 0", [])?;
                }
                tx.execute(
                    "INSERT INTO project_languages
                        (language, root_path, is_primary, frameworks, build_tool,
                         test_command, lint_command, build_command, detected_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(language, root_path) DO UPDATE SET
                        is_primary = excluded.is_primary,
                        frameworks = excluded.frameworks,
                        build_tool = excluded.build_tool,
                        test_command = excluded.test_command,
                        lint_command = excluded.lint_command,
                        build_command = excluded.build_command,
                        detected_at = excluded.detected_at",
                    rusqlite::params![
                        l.language,
                        l.root_path,
                        l.is_primary,
                        serde_json::to_string(&l.frameworks).expect("serialize frameworks"),
                        l.build_tool,
                        l.test_command,
                        l.lint_command,
                        l.build_command,
                        ts_to_sql(&l.detected_at),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_project_language(
        &self,
        language: &str,
        root_path: &str,
    ) -> Result<Option<ProjectLanguage>> {
        let language = language.to_string();
        let root_path = root_path.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT language, root_path, is_primary, frameworks, build_tool,
                            test_command, lint_command, build_command, detected_at
                     FROM project_languages WHERE language = ?1 AND root_path = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![language, root_path])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_language(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .op("get project language")
    }

    pub async fn list_project_languages(&self) -> Result<Vec<ProjectLanguage>> {
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT language, root_path, is_primary, frameworks, build_tool,
                            test_command, lint_command, build_command, detected_at
                     FROM project_languages ORDER BY is_primary DESC, language, root_path",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_language(row)?);
                }
                Ok(out)
            })
            .await
            .op("list project languages")
    }

    pub async fn primary_language(&self) -> Result<Option<ProjectLanguage>> {
        Ok(self
            .list_project_languages()
            .await?
            .into_iter()
            .find(|l| l.is_primary))
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(3)?;
    let weight: String = row.get(4)?;
    let category: String = row.get(5)?;
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: enum_from_sql(&status),
        weight: enum_from_sql(&weight),
        category: enum_from_sql(&category),
        branch: row.get(6)?,
        current_phase: row.get(7)?,
        session_model: row.get(8)?,
        created_at: ts_from_sql(&row.get::<_, String>(9)?),
        updated_at: ts_from_sql(&row.get::<_, String>(10)?),
        completed_at: opt_ts_from_sql(row.get(11)?),
        initiative_id: row.get(12)?,
    })
}

fn row_to_phase(row: &rusqlite::Row<'_>) -> rusqlite::Result<PhaseState> {
    let status: String = row.get(2)?;
    Ok(PhaseState {
        task_id: row.get(0)?,
        phase: row.get(1)?,
        status: enum_from_sql::<PhaseStatus>(&status),
        started_at: opt_ts_from_sql(row.get(3)?),
        completed_at: opt_ts_from_sql(row.get(4)?),
        iterations: row.get(5)?,
    })
}

fn row_to_gate(row: &rusqlite::Row<'_>) -> rusqlite::Result<GateDecision> {
    let gate_type: String = row.get(3)?;
    Ok(GateDecision {
        id: row.get(0)?,
        task_id: row.get(1)?,
        phase: row.get(2)?,
        gate_type: enum_from_sql(&gate_type),
        approved: row.get(4)?,
        rationale: row.get(5)?,
        decided_by: row.get(6)?,
        decided_at: ts_from_sql(&row.get::<_, String>(7)?),
    })
}

fn row_to_subtask(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subtask> {
    let status: String = row.get(6)?;
    Ok(Subtask {
        id: row.get(0)?,
        parent_task_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        proposed_by: row.get(4)?,
        proposed_at: ts_from_sql(&row.get::<_, String>(5)?),
        status: enum_from_sql(&status),
        approved_by: row.get(7)?,
        approved_at: opt_ts_from_sql(row.get(8)?),
        rejected_reason: row.get(9)?,
        created_task_id: row.get(10)?,
    })
}

fn row_to_knowledge(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeEntry> {
    let kind: String = row.get(1)?;
    let scope: String = row.get(4)?;
    let status: String = row.get(6)?;
    Ok(KnowledgeEntry {
        id: row.get(0)?,
        kind: enum_from_sql(&kind),
        name: row.get(2)?,
        description: row.get(3)?,
        scope: enum_from_sql(&scope),
        source_task: row.get(5)?,
        status: enum_from_sql(&status),
        proposed_at: ts_from_sql(&row.get::<_, String>(7)?),
        approved_at: opt_ts_from_sql(row.get(8)?),
        validated_at: opt_ts_from_sql(row.get(9)?),
        validated_by: row.get(10)?,
    })
}

fn row_to_constitution_check(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConstitutionCheck> {
    let violations_raw: String = row.get(4)?;
    // Malformed violation JSON is a secondary-column defect; log and read as
    // empty rather than failing the whole row.
    let violations: Vec<String> = serde_json::from_str(&violations_raw).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "malformed violations json; reading as empty");
        Vec::new()
    });
    Ok(ConstitutionCheck {
        id: row.get(0)?,
        task_id: row.get(1)?,
        phase: row.get(2)?,
        passed: row.get(3)?,
        violations,
        checked_at: ts_from_sql(&row.get::<_, String>(5)?),
    })
}

fn row_to_language(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectLanguage> {
    let frameworks_raw: String = row.get(3)?;
    Ok(ProjectLanguage {
        language: row.get(0)?,
        root_path: row.get(1)?,
        is_primary: row.get(2)?,
        frameworks: serde_json::from_str(&frameworks_raw).unwrap_or_default(),
        build_tool: row.get(4)?,
        test_command: row.get(5)?,
        lint_command: row.get(6)?,
        build_command: row.get(7)?,
        detected_at: ts_from_sql(&row.get::<_, String>(8)?),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use orc_core::types::{TaskCategory, TaskWeight};

    async fn store() -> TaskStore {
        TaskStore::new(ProjectDb::open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn create_task_allocates_sequential_ids() {
        let store = store().await;
        let t1 = store
            .create_task("first", None, TaskWeight::Small, TaskCategory::Feature)
            .await
            .unwrap();
        let t2 = store
            .create_task("second", None, TaskWeight::Medium, TaskCategory::Bug)
            .await
            .unwrap();
        assert_eq!(t1.id, "TASK-1");
        assert_eq!(t2.id, "TASK-2");
        assert_eq!(t1.status, TaskStatus::Created);
    }

    #[tokio::test]
    async fn completed_at_follows_terminal_status() {
        let store = store().await;
        let t = store
            .create_task("t", None, TaskWeight::Small, TaskCategory::Chore)
            .await
            .unwrap();

        store
            .update_task_status(&t.id, TaskStatus::Planned)
            .await
            .unwrap();
        let planned = store.get_task(&t.id).await.unwrap().unwrap();
        assert!(planned.completed_at.is_none());

        store
            .update_task_status(&t.id, TaskStatus::Completed)
            .await
            .unwrap();
        let done = store.get_task(&t.id).await.unwrap().unwrap();
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn branch_is_unique_per_project() {
        let store = store().await;
        let t1 = store
            .create_task("a", None, TaskWeight::Small, TaskCategory::Feature)
            .await
            .unwrap();
        let t2 = store
            .create_task("b", None, TaskWeight::Small, TaskCategory::Feature)
            .await
            .unwrap();

        store.set_task_branch(&t1.id, "orc/task-1").await.unwrap();
        let err = store.set_task_branch(&t2.id, "orc/task-1").await;
        assert!(matches!(err, Err(StoreError::BranchTaken(_))));
    }

    #[tokio::test]
    async fn iteration_seq_is_monotonic_per_phase() {
        let store = store().await;
        let i1 = store
            .start_iteration("TASK-1", "implement", None)
            .await
            .unwrap();
        let i2 = store
            .start_iteration("TASK-1", "implement", None)
            .await
            .unwrap();
        let other = store.start_iteration("TASK-1", "review", None).await.unwrap();
        assert_eq!(i1.seq, 1);
        assert_eq!(i2.seq, 2);
        assert_eq!(other.seq, 1);
    }

    #[tokio::test]
    async fn latest_gate_wins() {
        let store = store().await;
        store
            .record_gate("TASK-1", "spec", GateType::Auto, false, None, None)
            .await
            .unwrap();
        store
            .record_gate(
                "TASK-1",
                "spec",
                GateType::Human,
                true,
                Some("lgtm".into()),
                Some("sam".into()),
            )
            .await
            .unwrap();

        let latest = store.latest_gate("TASK-1", "spec").await.unwrap().unwrap();
        assert!(latest.approved);
        assert_eq!(latest.gate_type, GateType::Human);

        let all = store.list_gates("TASK-1").await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(!all[0].approved);
    }

    #[tokio::test]
    async fn subtask_approval_requires_pending() {
        let store = store().await;
        let st = Subtask::new("TASK-1", "extract helper");
        store.propose_subtask(&st).await.unwrap();

        store.approve_subtask(&st.id, "sam").await.unwrap();
        // Second approval hits a non-pending row.
        let err = store.approve_subtask(&st.id, "sam").await;
        assert!(matches!(err, Err(StoreError::Conflict(_))));

        store.link_created_task(&st.id, "TASK-9").await.unwrap();
        let listed = store.list_subtasks("TASK-1", None).await.unwrap();
        assert_eq!(listed[0].created_task_id.as_deref(), Some("TASK-9"));
    }

    #[tokio::test]
    async fn reject_missing_subtask_conflicts() {
        let store = store().await;
        let err = store.reject_subtask("ST-deadbeef", "nope").await;
        assert!(matches!(err, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn knowledge_bulk_approve_and_staleness() {
        let store = store().await;
        let e1 = KnowledgeEntry::new(
            orc_core::types::KnowledgeKind::Pattern,
            "retry",
            "use backoff",
        );
        let e2 = KnowledgeEntry::new(
            orc_core::types::KnowledgeKind::Gotcha,
            "tz",
            "timestamps are utc",
        );
        store.propose_knowledge(&e1).await.unwrap();
        store.propose_knowledge(&e2).await.unwrap();

        let approved = store.approve_all_pending_knowledge("sam").await.unwrap();
        assert_eq!(approved, 2);

        // Entries approved just now are not stale.
        let stale = store.stale_knowledge(30, Utc::now()).await.unwrap();
        assert!(stale.is_empty());

        // But viewed from 40 days in the future, they are; validating one
        // clears it.
        let future = Utc::now() + chrono::Duration::days(40);
        let stale = store.stale_knowledge(30, future).await.unwrap();
        assert_eq!(stale.len(), 2);

        store.validate_knowledge(&e1.id, "sam").await.unwrap();
        let entries = store.list_knowledge(None).await.unwrap();
        let validated = entries.iter().find(|e| e.id == e1.id).unwrap();
        assert!(validated.validated_at.is_some());
    }

    #[tokio::test]
    async fn constitution_check_absent_is_none() {
        let store = store().await;
        assert!(store
            .latest_constitution_check("TASK-1", "spec")
            .await
            .unwrap()
            .is_none());

        store
            .record_constitution_check("TASK-1", "spec", false, vec!["breaks rule 1".into()])
            .await
            .unwrap();
        let latest = store
            .latest_constitution_check("TASK-1", "spec")
            .await
            .unwrap()
            .unwrap();
        assert!(!latest.passed);
        assert_eq!(latest.violations.len(), 1);
    }

    #[tokio::test]
    async fn malformed_violations_read_as_empty() {
        let store = store().await;
        store
            .db
            .connection()
            .call(|conn| {
                conn.execute(
                    "INSERT INTO constitution_checks (task_id, phase, passed, violations, checked_at)
                     VALUES ('TASK-1', 'spec', 0, 'not json', ?1)",
                    rusqlite::params![ts_to_sql(&Utc::now())],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let latest = store
            .latest_constitution_check("TASK-1", "spec")
            .await
            .unwrap()
            .unwrap();
        assert!(latest.violations.is_empty());
    }

    #[tokio::test]
    async fn project_language_primary_is_exclusive() {
        let store = store().await;
        let mk = |language: &str, root: &str, primary: bool| ProjectLanguage {
            language: language.into(),
            root_path: root.into(),
            is_primary: primary,
            frameworks: vec!["axum".into()],
            build_tool: Some("cargo".into()),
            test_command: Some("cargo test".into()),
            lint_command: Some("cargo clippy".into()),
            build_command: Some("cargo build".into()),
            detected_at: Utc::now(),
        };

        store.save_project_language(&mk("rust", "/", true)).await.unwrap();
        store
            .save_project_language(&mk("typescript", "/web", true))
            .await
            .unwrap();

        let primary = store.primary_language().await.unwrap().unwrap();
        assert_eq!(primary.language, "typescript");

        let rust = store.get_project_language("rust", "/").await.unwrap().unwrap();
        assert!(!rust.is_primary);
        assert_eq!(rust.frameworks, vec!["axum".to_string()]);
    }
}
