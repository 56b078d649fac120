use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// InitiativeStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InitiativeStatus {
    #[default]
    Draft,
    Active,
    Completed,
    Archived,
}

// ---------------------------------------------------------------------------
// MergeStatus
// ---------------------------------------------------------------------------

/// Merge progress of an initiative's integration branch.
///
/// The unset state is serialized as an empty string for YAML stability, and
/// the literal `"none"` deserializes identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStatus {
    #[default]
    None,
    Pending,
    InProgress,
    Merged,
    Failed,
}

impl MergeStatus {
    /// Lenient parse for projection rows; unknown strings read as unset.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "pending" => MergeStatus::Pending,
            "in_progress" => MergeStatus::InProgress,
            "merged" => MergeStatus::Merged,
            "failed" => MergeStatus::Failed,
            _ => MergeStatus::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStatus::None => "",
            MergeStatus::Pending => "pending",
            MergeStatus::InProgress => "in_progress",
            MergeStatus::Merged => "merged",
            MergeStatus::Failed => "failed",
        }
    }
}

impl Serialize for MergeStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MergeStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.as_str() {
            "" | "none" => Ok(MergeStatus::None),
            "pending" => Ok(MergeStatus::Pending),
            "in_progress" => Ok(MergeStatus::InProgress),
            "merged" => Ok(MergeStatus::Merged),
            "failed" => Ok(MergeStatus::Failed),
            other => Err(serde::de::Error::custom(format!(
                "unknown merge status: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Owner / Decision / TaskRef
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Owner {
    #[serde(default)]
    pub initials: String,
    #[serde(default)]
    pub display: String,
    #[serde(default)]
    pub email: String,
}

/// A recorded decision, `DEC-NNN` three-digit zero-padded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub date: String,
    pub by: String,
    pub decision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// Format a decision counter, e.g. `decision_id(7) == "DEC-007"`.
pub fn decision_id(n: u32) -> String {
    format!("DEC-{n:03}")
}

/// Reference to a task inside an initiative. `status` is the stored view;
/// live status comes from a [`TaskStatusLoader`] overlay at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default = "default_task_ref_status")]
    pub status: String,
}

fn default_task_ref_status() -> String {
    "pending".to_string()
}

/// Live task state overlaid on a stored [`TaskRef`].
#[derive(Debug, Clone)]
pub struct TaskOverlay {
    pub status: String,
    pub title: String,
}

/// Read-side seam for overlaying live task status; the task store implements
/// it, tests use a map.
pub trait TaskStatusLoader {
    fn load_task(&self, task_id: &str) -> Option<TaskOverlay>;
}

impl TaskStatusLoader for std::collections::HashMap<String, TaskOverlay> {
    fn load_task(&self, task_id: &str) -> Option<TaskOverlay> {
        self.get(task_id).cloned()
    }
}

/// Task ref statuses considered runnable when computing ready tasks.
const RUNNABLE_STATUSES: &[&str] = &["pending", "created", "planned"];
/// Dependency statuses considered done. The legacy store path only ever
/// wrote "completed"; the loader path also sees "finished".
const DONE_STATUSES: &[&str] = &["completed", "finished"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockerInfo {
    pub id: String,
    pub title: String,
    pub status: String,
}

// ---------------------------------------------------------------------------
// Initiative
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Initiative {
    pub version: u32,
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub status: InitiativeStatus,
    #[serde(default)]
    pub owner: Owner,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decisions: Vec<Decision>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
    /// Inverse of `blocked_by`, computed on demand. Never persisted.
    #[serde(skip)]
    pub blocks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_prefix: Option<String>,
    #[serde(default)]
    pub merge_status: MergeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Initiative {
    /// Seed a new draft initiative. The id must already be validated.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: 1,
            id: id.into(),
            title: title.into(),
            status: InitiativeStatus::Draft,
            owner: Owner::default(),
            vision: None,
            decisions: Vec::new(),
            tasks: Vec::new(),
            blocked_by: Vec::new(),
            blocks: Vec::new(),
            branch_base: None,
            branch_prefix: None,
            merge_status: MergeStatus::None,
            merge_commit: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Upsert a task ref; new refs start as `pending`.
    pub fn add_task(&mut self, id: impl Into<String>, title: impl Into<String>, depends_on: Vec<String>) {
        let id = id.into();
        let title = title.into();
        match self.tasks.iter_mut().find(|t| t.id == id) {
            Some(existing) => {
                existing.title = title;
                existing.depends_on = depends_on;
            }
            None => self.tasks.push(TaskRef {
                id,
                title,
                depends_on,
                status: default_task_ref_status(),
            }),
        }
        self.updated_at = Utc::now();
    }

    /// Append a decision with the next `DEC-NNN` id.
    pub fn record_decision(
        &mut self,
        by: impl Into<String>,
        decision: impl Into<String>,
        rationale: Option<String>,
    ) -> &Decision {
        let next = decision_id(self.decisions.len() as u32 + 1);
        self.decisions.push(Decision {
            id: next,
            date: Utc::now().format("%Y-%m-%d").to_string(),
            by: by.into(),
            decision: decision.into(),
            rationale,
        });
        self.updated_at = Utc::now();
        self.decisions.last().expect("just pushed")
    }

    /// Overlay live status/title onto this in-memory value. Only the copy
    /// changes; nothing is written back to disk.
    pub fn enrich_task_statuses(&mut self, loader: &dyn TaskStatusLoader) {
        for task in &mut self.tasks {
            if let Some(overlay) = loader.load_task(&task.id) {
                task.status = overlay.status;
                task.title = overlay.title;
            }
        }
    }

    /// Stored task refs with live status/title overlaid from the loader.
    /// The read path never mutates persisted data.
    pub fn tasks_with_status(&self, loader: &dyn TaskStatusLoader) -> Vec<TaskRef> {
        self.tasks
            .iter()
            .map(|t| {
                let mut enriched = t.clone();
                if let Some(overlay) = loader.load_task(&t.id) {
                    enriched.status = overlay.status;
                    enriched.title = overlay.title;
                }
                enriched
            })
            .collect()
    }

    /// Ready tasks under live status: runnable, with every dependency done.
    pub fn ready_tasks_with_loader(&self, loader: &dyn TaskStatusLoader) -> Vec<TaskRef> {
        let enriched = self.tasks_with_status(loader);
        Self::ready_among(&enriched)
    }

    /// Ready tasks using only the stored status (legacy path, no loader).
    pub fn ready_tasks(&self) -> Vec<TaskRef> {
        Self::ready_among(&self.tasks)
    }

    fn ready_among(tasks: &[TaskRef]) -> Vec<TaskRef> {
        tasks
            .iter()
            .filter(|t| {
                RUNNABLE_STATUSES.contains(&t.status.as_str())
                    && t.depends_on.iter().all(|dep| {
                        tasks
                            .iter()
                            .find(|other| &other.id == dep)
                            .is_some_and(|other| DONE_STATUSES.contains(&other.status.as_str()))
                    })
            })
            .cloned()
            .collect()
    }

    pub fn all_tasks_complete(&self) -> bool {
        !self.tasks.is_empty()
            && self
                .tasks
                .iter()
                .all(|t| DONE_STATUSES.contains(&t.status.as_str()))
    }

    /// Ready for the merge workflow: has an integration branch, every task
    /// done, and not already merged.
    pub fn is_ready_for_merge(&self) -> bool {
        self.branch_base.is_some()
            && self.all_tasks_complete()
            && self.merge_status != MergeStatus::Merged
    }

    /// Branch prefix tasks in this initiative use, defaulting to `orc/`.
    pub fn task_branch_prefix(&self) -> &str {
        self.branch_prefix.as_deref().unwrap_or("orc/")
    }
}

// ---------------------------------------------------------------------------
// ID validation
// ---------------------------------------------------------------------------

/// Validate an initiative id: `INIT-` followed by alphanumerics and dashes,
/// starting and ending alphanumeric, with no path-traversal characters.
pub fn validate_id(id: &str) -> Result<(), String> {
    if id.contains("..") || id.contains('/') || id.contains('\\') {
        return Err(format!("initiative id contains path characters: {id}"));
    }
    let Some(rest) = id.strip_prefix("INIT-") else {
        return Err(format!("initiative id must start with INIT-: {id}"));
    };
    if rest.is_empty() {
        return Err(format!("initiative id has empty suffix: {id}"));
    }
    let chars: Vec<char> = rest.chars().collect();
    let all_valid = chars.iter().all(|c| c.is_ascii_alphanumeric() || *c == '-');
    let ends_valid = chars[0].is_ascii_alphanumeric()
        && chars[chars.len() - 1].is_ascii_alphanumeric();
    if !all_valid || !ends_valid {
        return Err(format!("initiative id is not valid: {id}"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn id_validation() {
        assert!(validate_id("INIT-001").is_ok());
        assert!(validate_id("INIT-a").is_ok());
        assert!(validate_id("INIT-auth-rework-2").is_ok());

        assert!(validate_id("TASK-001").is_err());
        assert!(validate_id("INIT-").is_err());
        assert!(validate_id("INIT--x").is_err());
        assert!(validate_id("INIT-x-").is_err());
        assert!(validate_id("INIT-a/../b").is_err());
        assert!(validate_id("INIT-a\\b").is_err());
        assert!(validate_id("INIT-a b").is_err());
    }

    #[test]
    fn merge_status_none_aliases() {
        let none: MergeStatus = serde_yaml::from_str("\"\"").unwrap();
        assert_eq!(none, MergeStatus::None);
        let none: MergeStatus = serde_yaml::from_str("none").unwrap();
        assert_eq!(none, MergeStatus::None);
        let merged: MergeStatus = serde_yaml::from_str("merged").unwrap();
        assert_eq!(merged, MergeStatus::Merged);

        // Always serialized as the empty string.
        assert_eq!(serde_yaml::to_string(&MergeStatus::None).unwrap().trim(), "''");
    }

    #[test]
    fn yaml_roundtrip_ignores_unknown_fields_and_skips_blocks() {
        let mut init = Initiative::new("INIT-001", "Auth rework");
        init.blocked_by = vec!["INIT-000".into()];
        init.blocks = vec!["INIT-002".into()]; // computed, must not persist
        init.add_task("TASK-1", "first", vec![]);

        let yaml = serde_yaml::to_string(&init).unwrap();
        assert!(!yaml.contains("blocks:"));
        assert!(yaml.contains("blocked_by:"));
        assert!(!yaml.contains("INIT-002"));

        // Unknown fields from newer writers are ignored on load.
        let with_extra = format!("{yaml}\nfuture_field: 42\n");
        let back: Initiative = serde_yaml::from_str(&with_extra).unwrap();
        assert_eq!(back.id, "INIT-001");
        assert!(back.blocks.is_empty());
        assert_eq!(back.blocked_by, vec!["INIT-000".to_string()]);
        assert_eq!(back.tasks[0].status, "pending");
    }

    #[test]
    fn decision_ids_are_zero_padded() {
        assert_eq!(decision_id(1), "DEC-001");
        assert_eq!(decision_id(42), "DEC-042");

        let mut init = Initiative::new("INIT-001", "t");
        init.record_decision("sam", "use sqlite", None);
        init.record_decision("sam", "ship weekly", Some("cadence".into()));
        assert_eq!(init.decisions[0].id, "DEC-001");
        assert_eq!(init.decisions[1].id, "DEC-002");
    }

    #[test]
    fn ready_tasks_respect_dependencies() {
        let mut init = Initiative::new("INIT-001", "t");
        init.add_task("TASK-1", "one", vec![]);
        init.add_task("TASK-2", "two", vec!["TASK-1".into()]);
        init.add_task("TASK-3", "three", vec!["TASK-1".into(), "TASK-2".into()]);
        init.add_task("TASK-4", "four", vec![]);

        let ready: Vec<String> = init.ready_tasks().into_iter().map(|t| t.id).collect();
        assert_eq!(ready, vec!["TASK-1", "TASK-4"]);

        // Complete 1: task 2 unblocks.
        init.tasks[0].status = "completed".into();
        let ready: Vec<String> = init.ready_tasks().into_iter().map(|t| t.id).collect();
        assert_eq!(ready, vec!["TASK-2", "TASK-4"]);

        // Complete 2: task 3 unblocks.
        init.tasks[1].status = "completed".into();
        let ready: Vec<String> = init.ready_tasks().into_iter().map(|t| t.id).collect();
        assert_eq!(ready, vec!["TASK-3", "TASK-4"]);
    }

    #[test]
    fn loader_overlay_drives_readiness_without_mutation() {
        let mut init = Initiative::new("INIT-001", "t");
        init.add_task("TASK-1", "one", vec![]);
        init.add_task("TASK-2", "two", vec!["TASK-1".into()]);

        let mut live = HashMap::new();
        live.insert(
            "TASK-1".to_string(),
            TaskOverlay {
                status: "finished".into(),
                title: "one (renamed)".into(),
            },
        );

        let ready = init.ready_tasks_with_loader(&live);
        let ids: Vec<&str> = ready.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["TASK-2"]);

        // The stored refs are untouched by the read path.
        assert_eq!(init.tasks[0].status, "pending");
        assert_eq!(init.tasks[0].title, "one");
    }

    #[test]
    fn merge_readiness() {
        let mut init = Initiative::new("INIT-001", "t");
        assert!(!init.is_ready_for_merge()); // no branch, no tasks

        init.branch_base = Some("feature/auth".into());
        init.add_task("TASK-1", "one", vec![]);
        assert!(!init.is_ready_for_merge()); // task not complete

        init.tasks[0].status = "completed".into();
        assert!(init.is_ready_for_merge());

        init.merge_status = MergeStatus::Merged;
        assert!(!init.is_ready_for_merge());
    }

    #[test]
    fn branch_prefix_defaults() {
        let mut init = Initiative::new("INIT-001", "t");
        assert_eq!(init.task_branch_prefix(), "orc/");
        init.branch_prefix = Some("auth/".into());
        assert_eq!(init.task_branch_prefix(), "auth/");
    }
}
