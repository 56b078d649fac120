//! The finalize controller: the long-running merge-back workflow.
//!
//! Five named steps run in order, each bumping `step_percent` and publishing
//! a `finalize` event: sync the target into the task branch, resolve
//! conflicts, run the test suite, assess risk, merge. State is kept per task
//! in a shared registry; a run may only start from `not_started` or `failed`
//! (retry), and a failure records the error and allows another trigger.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use orc_bridge::event_bus::EventBus;
use orc_bridge::protocol::{EventKind, OrcEvent};
use orc_core::git::run_git;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// State types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeStatus {
    #[default]
    NotStarted,
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeResult {
    pub commit_sha: Option<String>,
    pub target_branch: String,
    pub files_changed: u32,
    pub conflicts_resolved: u32,
    pub tests_passed: bool,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeState {
    pub task_id: String,
    pub status: FinalizeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    pub step_percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<FinalizeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl FinalizeState {
    fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: FinalizeStatus::NotStarted,
            step: None,
            progress: None,
            step_percent: 0,
            result: None,
            error: None,
            updated_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    #[error("finalize already {0:?} for task")]
    AlreadyActive(FinalizeStatus),
    #[error("finalize step {step} failed: {message}")]
    Step { step: &'static str, message: String },
}

// ---------------------------------------------------------------------------
// Step seam
// ---------------------------------------------------------------------------

/// The five workflow steps, separated from orchestration so tests can
/// script them. The production implementation shells out to git.
#[async_trait::async_trait]
pub trait FinalizeSteps: Send + Sync {
    /// Fast-forward the target branch into the task branch.
    async fn sync(&self, task_id: &str) -> Result<(), String>;
    /// Resolve conflicts; returns how many were resolved.
    async fn resolve_conflicts(&self, task_id: &str) -> Result<u32, String>;
    /// Run the full test suite; returns whether it passed.
    async fn run_tests(&self, task_id: &str) -> Result<bool, String>;
    /// Classify the merge risk.
    async fn assess_risk(&self, task_id: &str) -> Result<RiskLevel, String>;
    /// Produce the merge commit; returns `(sha, files_changed)`.
    async fn merge(&self, task_id: &str) -> Result<(String, u32), String>;
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Step names with their progress checkpoints; `step_percent` is strictly
/// increasing across the workflow.
const STEPS: &[(&str, u8)] = &[
    ("sync", 10),
    ("resolve", 30),
    ("test", 55),
    ("risk", 75),
    ("merge", 95),
];

pub struct FinalizeController {
    project: String,
    target_branch: String,
    states: DashMap<String, FinalizeState>,
    bus: EventBus,
    steps: Arc<dyn FinalizeSteps>,
}

impl FinalizeController {
    pub fn new(
        project: impl Into<String>,
        target_branch: impl Into<String>,
        bus: EventBus,
        steps: Arc<dyn FinalizeSteps>,
    ) -> Self {
        Self {
            project: project.into(),
            target_branch: target_branch.into(),
            states: DashMap::new(),
            bus,
            steps,
        }
    }

    /// Current state for a task; `not_started` when never triggered.
    pub fn state(&self, task_id: &str) -> FinalizeState {
        self.states
            .get(task_id)
            .map(|s| s.clone())
            .unwrap_or_else(|| FinalizeState::new(task_id))
    }

    /// Run the finalize workflow for a task. Only `not_started` and
    /// `failed` (retry) may start; anything else is rejected.
    pub async fn trigger(&self, task_id: &str) -> Result<FinalizeResult, FinalizeError> {
        {
            let current = self.state(task_id);
            match current.status {
                FinalizeStatus::NotStarted | FinalizeStatus::Failed => {}
                other => return Err(FinalizeError::AlreadyActive(other)),
            }
            self.update(task_id, |s| {
                s.status = FinalizeStatus::Pending;
                s.step = None;
                s.progress = None;
                s.step_percent = 0;
                s.error = None;
                s.result = None;
            });
        }

        match self.run_workflow(task_id).await {
            Ok(result) => {
                self.update(task_id, |s| {
                    s.status = FinalizeStatus::Completed;
                    s.step = None;
                    s.progress = Some("merged".into());
                    s.step_percent = 100;
                    s.result = Some(result.clone());
                });
                Ok(result)
            }
            Err(err) => {
                self.update(task_id, |s| {
                    s.status = FinalizeStatus::Failed;
                    s.error = Some(err.to_string());
                });
                Err(err)
            }
        }
    }

    async fn run_workflow(&self, task_id: &str) -> Result<FinalizeResult, FinalizeError> {
        self.enter_step(task_id, 0);
        self.steps
            .sync(task_id)
            .await
            .map_err(|message| FinalizeError::Step { step: "sync", message })?;

        self.enter_step(task_id, 1);
        let conflicts_resolved = self
            .steps
            .resolve_conflicts(task_id)
            .await
            .map_err(|message| FinalizeError::Step { step: "resolve", message })?;

        self.enter_step(task_id, 2);
        let tests_passed = self
            .steps
            .run_tests(task_id)
            .await
            .map_err(|message| FinalizeError::Step { step: "test", message })?;
        if !tests_passed {
            return Err(FinalizeError::Step {
                step: "test",
                message: "test suite failed".into(),
            });
        }

        self.enter_step(task_id, 3);
        let risk_level = self
            .steps
            .assess_risk(task_id)
            .await
            .map_err(|message| FinalizeError::Step { step: "risk", message })?;

        self.enter_step(task_id, 4);
        let (commit_sha, files_changed) = self
            .steps
            .merge(task_id)
            .await
            .map_err(|message| FinalizeError::Step { step: "merge", message })?;

        Ok(FinalizeResult {
            commit_sha: Some(commit_sha),
            target_branch: self.target_branch.clone(),
            files_changed,
            conflicts_resolved,
            tests_passed,
            risk_level,
        })
    }

    fn enter_step(&self, task_id: &str, index: usize) {
        let (name, percent) = STEPS[index];
        self.update(task_id, |s| {
            s.status = FinalizeStatus::Running;
            s.step = Some(name.to_string());
            s.progress = Some(format!("running {name}"));
            s.step_percent = percent;
        });
    }

    /// Apply a mutation and publish the new state as a `finalize` event.
    fn update(&self, task_id: &str, mutate: impl FnOnce(&mut FinalizeState)) {
        let mut entry = self
            .states
            .entry(task_id.to_string())
            .or_insert_with(|| FinalizeState::new(task_id));
        mutate(&mut entry);
        entry.updated_at = Utc::now();
        let snapshot = entry.clone();
        drop(entry);

        self.bus.publish(OrcEvent::new(
            &self.project,
            task_id,
            EventKind::Finalize,
            serde_json::to_value(&snapshot).expect("serialize finalize state"),
        ));
    }
}

// ---------------------------------------------------------------------------
// Git-backed steps
// ---------------------------------------------------------------------------

/// Production steps: everything shells out to `git -C <root>`; the test
/// command comes from the detected project language.
pub struct GitFinalizeSteps {
    pub project_root: PathBuf,
    pub target_branch: String,
    pub branch_prefix: String,
    pub test_command: Option<String>,
}

impl GitFinalizeSteps {
    fn task_branch(&self, task_id: &str) -> String {
        format!("{}{}", self.branch_prefix, task_id.to_lowercase())
    }
}

#[async_trait::async_trait]
impl FinalizeSteps for GitFinalizeSteps {
    async fn sync(&self, task_id: &str) -> Result<(), String> {
        let branch = self.task_branch(task_id);
        run_git(&self.project_root, &["checkout", &branch])
            .await
            .map_err(|e| e.to_string())?;
        run_git(&self.project_root, &["merge", "--no-edit", &self.target_branch])
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn resolve_conflicts(&self, _task_id: &str) -> Result<u32, String> {
        // Conflicted paths remaining after sync mean the merge needs the
        // agent's conflict-resolution pass; a clean tree resolves zero.
        let status = run_git(&self.project_root, &["diff", "--name-only", "--diff-filter=U"])
            .await
            .map_err(|e| e.to_string())?;
        let conflicted = status.lines().filter(|l| !l.is_empty()).count() as u32;
        if conflicted > 0 {
            return Err(format!("{conflicted} unresolved conflicts"));
        }
        Ok(0)
    }

    async fn run_tests(&self, _task_id: &str) -> Result<bool, String> {
        let Some(command) = &self.test_command else {
            return Ok(true); // nothing configured to run
        };
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.project_root)
            .output()
            .await
            .map_err(|e| e.to_string())?;
        Ok(output.status.success())
    }

    async fn assess_risk(&self, task_id: &str) -> Result<RiskLevel, String> {
        let branch = self.task_branch(task_id);
        let stat = run_git(
            &self.project_root,
            &["diff", "--shortstat", &format!("{}...{branch}", self.target_branch)],
        )
        .await
        .map_err(|e| e.to_string())?;
        let files_changed = parse_files_changed(&stat);
        Ok(match files_changed {
            0..=3 => RiskLevel::Low,
            4..=15 => RiskLevel::Medium,
            _ => RiskLevel::High,
        })
    }

    async fn merge(&self, task_id: &str) -> Result<(String, u32), String> {
        let branch = self.task_branch(task_id);
        let stat = run_git(
            &self.project_root,
            &["diff", "--shortstat", &format!("{}...{branch}", self.target_branch)],
        )
        .await
        .map_err(|e| e.to_string())?;
        let files_changed = parse_files_changed(&stat);

        run_git(&self.project_root, &["checkout", &self.target_branch])
            .await
            .map_err(|e| e.to_string())?;
        run_git(&self.project_root, &["merge", "--no-ff", "--no-edit", &branch])
            .await
            .map_err(|e| e.to_string())?;
        let sha = run_git(&self.project_root, &["rev-parse", "HEAD"])
            .await
            .map_err(|e| e.to_string())?;
        Ok((sha, files_changed))
    }
}

/// Pull the leading file count out of `git diff --shortstat` output.
fn parse_files_changed(shortstat: &str) -> u32 {
    shortstat
        .trim()
        .split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
