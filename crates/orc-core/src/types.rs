use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Planned,
    Running,
    Paused,
    Blocked,
    Completed,
    Failed,
    Resolved,
}

impl TaskStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Created, TaskStatus::Planned)
                | (TaskStatus::Planned, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Blocked)
                | (TaskStatus::Running, TaskStatus::Paused)
                | (TaskStatus::Blocked, TaskStatus::Running)
                | (TaskStatus::Paused, TaskStatus::Running)
                | (TaskStatus::Failed, TaskStatus::Running)
                | (TaskStatus::Failed, TaskStatus::Resolved)
        )
    }

    /// Terminal statuses carry a `completed_at` timestamp.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Resolved
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Planned => "planned",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Resolved => "resolved",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskWeight / TaskCategory / TaskPriority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskWeight {
    Trivial,
    Small,
    Medium,
    Large,
    Greenfield,
}

impl TaskWeight {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskWeight::Trivial => "trivial",
            TaskWeight::Small => "small",
            TaskWeight::Medium => "medium",
            TaskWeight::Large => "large",
            TaskWeight::Greenfield => "greenfield",
        }
    }
}

impl std::str::FromStr for TaskWeight {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trivial" => Ok(TaskWeight::Trivial),
            "small" => Ok(TaskWeight::Small),
            "medium" => Ok(TaskWeight::Medium),
            "large" => Ok(TaskWeight::Large),
            "greenfield" => Ok(TaskWeight::Greenfield),
            other => Err(format!("unknown weight: {other}")),
        }
    }
}

impl fmt::Display for TaskWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Feature,
    Bug,
    Refactor,
    Chore,
    Docs,
    Test,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::Feature => "feature",
            TaskCategory::Bug => "bug",
            TaskCategory::Refactor => "refactor",
            TaskCategory::Chore => "chore",
            TaskCategory::Docs => "docs",
            TaskCategory::Test => "test",
        }
    }
}

impl std::str::FromStr for TaskCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "feature" => Ok(TaskCategory::Feature),
            "bug" => Ok(TaskCategory::Bug),
            "refactor" => Ok(TaskCategory::Refactor),
            "chore" => Ok(TaskCategory::Chore),
            "docs" => Ok(TaskCategory::Docs),
            "test" => Ok(TaskCategory::Test),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl std::str::FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// `TASK-<n>` where `n` is a per-project monotonic counter.
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub weight: TaskWeight,
    pub category: TaskCategory,
    /// Git branch the task's worktree is on. Unique per project when set.
    pub branch: Option<String>,
    pub current_phase: Option<String>,
    pub session_model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set iff status is terminal (completed / failed / resolved).
    pub completed_at: Option<DateTime<Utc>>,
    pub initiative_id: Option<String>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        weight: TaskWeight,
        category: TaskCategory,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            status: TaskStatus::Created,
            weight,
            category,
            branch: None,
            current_phase: None,
            session_model: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            initiative_id: None,
        }
    }
}

/// Format a numeric counter as a task id, e.g. `task_id(7) == "TASK-7"`.
pub fn task_id(n: u64) -> String {
    format!("TASK-{n}")
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
        }
    }
}

/// Per-task phase record, keyed by `(task_id, phase)`.
///
/// A task has at most one phase in `Running` state at a time; the engine
/// enforces this before starting a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseState {
    pub task_id: String,
    pub phase: String,
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub iterations: u32,
}

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOutcome {
    Completed,
    Failed,
    TimedOut,
}

/// One invocation of the external agent for a phase. `seq` is monotonic per
/// `(task_id, phase)`, starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub task_id: String,
    pub phase: String,
    pub seq: u32,
    pub prompt_ref: Option<String>,
    pub response_ref: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<IterationOutcome>,
}

// ---------------------------------------------------------------------------
// Gates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    Auto,
    Ai,
    Human,
}

impl GateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateType::Auto => "auto",
            GateType::Ai => "ai",
            GateType::Human => "human",
        }
    }
}

/// A recorded decision that authorizes (or blocks) a phase transition.
/// Decisions are ordered by `(decided_at, id)`; only the latest one for a
/// given `(task, phase)` dictates transition eligibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecision {
    pub id: i64,
    pub task_id: String,
    pub phase: String,
    pub gate_type: GateType,
    pub approved: bool,
    pub rationale: Option<String>,
    pub decided_by: Option<String>,
    pub decided_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Transcript
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TranscriptKind {
    User,
    Assistant,
    QueueOperation,
    Hook,
}

impl TranscriptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptKind::User => "user",
            TranscriptKind::Assistant => "assistant",
            TranscriptKind::QueueOperation => "queue-operation",
            TranscriptKind::Hook => "hook",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_creation: u64,
    pub cache_read: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output + self.cache_creation + self.cache_read
    }
}

/// A single transcript message from an agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    /// Database rowid; 0 before insertion.
    pub id: i64,
    pub task_id: String,
    pub phase: String,
    pub session_id: String,
    pub workflow_run_id: Option<String>,
    pub message_uuid: String,
    pub parent_uuid: Option<String>,
    pub kind: TranscriptKind,
    pub role: Option<String>,
    /// Message body as a JSON string (opaque to the store).
    pub content: String,
    pub model: Option<String>,
    pub tokens: TokenUsage,
    pub tool_calls: Option<String>,
    pub tool_results: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

impl Transcript {
    pub fn new(
        task_id: impl Into<String>,
        phase: impl Into<String>,
        session_id: impl Into<String>,
        kind: TranscriptKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            task_id: task_id.into(),
            phase: phase.into(),
            session_id: session_id.into(),
            workflow_run_id: None,
            message_uuid: Uuid::new_v4().to_string(),
            parent_uuid: None,
            kind,
            role: None,
            content: content.into(),
            model: None,
            tokens: TokenUsage::default(),
            tool_calls: None,
            tool_results: None,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

// ---------------------------------------------------------------------------
// Todo snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    pub status: String,
    pub active_form: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoSnapshot {
    pub id: i64,
    pub task_id: String,
    pub phase: String,
    pub message_uuid: Option<String>,
    pub items: Vec<TodoItem>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Subtask queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Approved,
    Rejected,
}

/// Follow-up work proposed by an agent during a phase. Sits in the queue as
/// `pending` until a human approves or rejects it; approval eventually
/// creates a real task linked via `created_task_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    /// `ST-<8hex>`.
    pub id: String,
    pub parent_task_id: String,
    pub title: String,
    pub description: Option<String>,
    pub proposed_by: Option<String>,
    pub proposed_at: DateTime<Utc>,
    pub status: SubtaskStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_reason: Option<String>,
    pub created_task_id: Option<String>,
}

impl Subtask {
    pub fn new(parent_task_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: subtask_id(),
            parent_task_id: parent_task_id.into(),
            title: title.into(),
            description: None,
            proposed_by: None,
            proposed_at: Utc::now(),
            status: SubtaskStatus::Pending,
            approved_by: None,
            approved_at: None,
            rejected_reason: None,
            created_task_id: None,
        }
    }
}

/// Fresh subtask id: `ST-` plus the first 8 hex chars of a v4 UUID.
pub fn subtask_id() -> String {
    format!("ST-{}", &Uuid::new_v4().simple().to_string()[..8])
}

// ---------------------------------------------------------------------------
// Knowledge queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeKind {
    Pattern,
    Gotcha,
    Decision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeScope {
    Project,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeStatus {
    Pending,
    Approved,
    Rejected,
}

/// A pattern / gotcha / decision proposed during a task and promoted to the
/// project's knowledge base once approved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    /// `K-<8hex>`.
    pub id: String,
    pub kind: KnowledgeKind,
    pub name: String,
    pub description: String,
    pub scope: KnowledgeScope,
    pub source_task: Option<String>,
    pub status: KnowledgeStatus,
    pub proposed_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub validated_at: Option<DateTime<Utc>>,
    pub validated_by: Option<String>,
}

impl KnowledgeEntry {
    pub fn new(kind: KnowledgeKind, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: knowledge_id(),
            kind,
            name: name.into(),
            description: description.into(),
            scope: KnowledgeScope::Project,
            source_task: None,
            status: KnowledgeStatus::Pending,
            proposed_at: Utc::now(),
            approved_at: None,
            validated_at: None,
            validated_by: None,
        }
    }

    /// An approved entry goes stale when neither validation nor approval
    /// happened within the staleness window.
    pub fn is_stale(&self, staleness_days: i64, now: DateTime<Utc>) -> bool {
        if self.status != KnowledgeStatus::Approved {
            return false;
        }
        let last = match (self.validated_at, self.approved_at) {
            (Some(v), Some(a)) => v.max(a),
            (Some(v), None) => v,
            (None, Some(a)) => a,
            (None, None) => return false,
        };
        last < now - chrono::Duration::days(staleness_days)
    }
}

/// Fresh knowledge id: `K-` plus the first 8 hex chars of a v4 UUID.
pub fn knowledge_id() -> String {
    format!("K-{}", &Uuid::new_v4().simple().to_string()[..8])
}

// ---------------------------------------------------------------------------
// Agents and phase templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDef {
    pub id: String,
    pub name: String,
    pub description: String,
    pub prompt: String,
    pub tools: Vec<String>,
    pub model: Option<String>,
    pub is_builtin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTemplate {
    pub id: String,
    pub name: String,
    pub prompt_source: String,
    pub prompt_path: Option<String>,
}

/// Binds an agent to a phase template.
///
/// Associations sharing a `sequence` run in parallel; ascending sequence
/// numbers run serially across groups. An empty `weight_filter` applies the
/// association to every task weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseAgent {
    pub id: String,
    pub phase_template_id: String,
    pub agent_id: String,
    pub sequence: i32,
    pub role: Option<String>,
    pub weight_filter: Vec<TaskWeight>,
    pub is_builtin: bool,
}

impl PhaseAgent {
    pub fn applies_to(&self, weight: TaskWeight) -> bool {
        self.weight_filter.is_empty() || self.weight_filter.contains(&weight)
    }
}

// ---------------------------------------------------------------------------
// Constitution
// ---------------------------------------------------------------------------

/// Project-level principles document, file-backed at `.orc/CONSTITUTION.md`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constitution {
    pub content: String,
    pub path: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstitutionCheck {
    pub id: i64,
    pub task_id: String,
    pub phase: String,
    pub passed: bool,
    pub violations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ProjectLanguage
// ---------------------------------------------------------------------------

/// A detected language root inside the project. Unique per
/// `(language, root_path)`; at most one row per project is primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectLanguage {
    pub language: String,
    pub root_path: String,
    pub is_primary: bool,
    pub frameworks: Vec<String>,
    pub build_tool: Option<String>,
    pub test_command: Option<String>,
    pub lint_command: Option<String>,
    pub build_command: Option<String>,
    pub detected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
