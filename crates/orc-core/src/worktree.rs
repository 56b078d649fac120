use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::git::{run_git, GitError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("worktree already exists: {0}")]
    AlreadyExists(String),
    #[error("worktree not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

// ---------------------------------------------------------------------------
// WorktreeInfo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: String,
    pub branch: String,
    pub base_branch: String,
    pub task_id: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// WorktreeManager
// ---------------------------------------------------------------------------

/// Manages git worktrees for isolated task execution.
///
/// Each task gets its own worktree under `.orc/worktrees/<task>/` relative to
/// the project root. The agent operates there on the task branch, keeping the
/// main checkout untouched while sharing git history.
pub struct WorktreeManager;

impl WorktreeManager {
    /// Create a new worktree for the given task.
    ///
    /// The worktree lands at `<root>/.orc/worktrees/<task>/` on a fresh
    /// branch `<branch_prefix><task>` cut from `base_branch`.
    pub async fn create(
        project_root: &Path,
        task_id: &str,
        branch_prefix: &str,
        base_branch: &str,
    ) -> Result<WorktreeInfo> {
        let sanitized = sanitize_name(task_id);
        let worktree_dir = worktree_path(project_root, &sanitized);
        let branch_name = format!("{branch_prefix}{sanitized}");

        if worktree_dir.exists() {
            return Err(WorktreeError::AlreadyExists(
                worktree_dir.display().to_string(),
            ));
        }

        let parent = worktree_dir.parent().expect("worktrees parent");
        std::fs::create_dir_all(parent)?;

        run_git(
            project_root,
            &[
                "worktree",
                "add",
                "-b",
                &branch_name,
                &worktree_dir.display().to_string(),
                base_branch,
            ],
        )
        .await?;

        Ok(WorktreeInfo {
            path: worktree_dir.display().to_string(),
            branch: branch_name,
            base_branch: base_branch.to_string(),
            task_id: sanitized,
            created_at: Utc::now(),
        })
    }

    /// Delete an existing worktree by its path.
    pub async fn remove(project_root: &Path, path: &str) -> Result<()> {
        if !Path::new(path).exists() {
            return Err(WorktreeError::NotFound(path.to_string()));
        }
        run_git(project_root, &["worktree", "remove", "--force", path]).await?;
        Ok(())
    }

    /// List all worktrees managed under `.orc/worktrees/` in the project.
    pub async fn list(project_root: &Path) -> Result<Vec<WorktreeInfo>> {
        let stdout = run_git(project_root, &["worktree", "list", "--porcelain"]).await?;

        let mut results = Vec::new();
        let mut current_path: Option<String> = None;
        let mut current_branch: Option<String> = None;

        // Porcelain output is blank-line separated blocks; a trailing
        // sentinel flushes the last block.
        for line in stdout.lines().chain(std::iter::once("")) {
            if let Some(path) = line.strip_prefix("worktree ") {
                current_path = Some(path.to_string());
                current_branch = None;
            } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
                current_branch = Some(branch.to_string());
            } else if line.is_empty() {
                if let (Some(ref path), Some(ref branch)) = (&current_path, &current_branch) {
                    if path.contains("/.orc/worktrees/") {
                        let task_id = Path::new(path)
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_default();
                        results.push(WorktreeInfo {
                            path: path.clone(),
                            branch: branch.clone(),
                            base_branch: String::new(), // not available from porcelain output
                            task_id,
                            created_at: Utc::now(), // approximate; git doesn't track this
                        });
                    }
                }
                current_path = None;
                current_branch = None;
            }
        }

        Ok(results)
    }
}

/// Sanitize a task id for use as a directory / branch segment.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .to_lowercase()
}

/// Build the worktree path under `.orc/worktrees/`.
fn worktree_path(project_root: &Path, sanitized_name: &str) -> PathBuf {
    project_root
        .join(".orc")
        .join("worktrees")
        .join(sanitized_name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_name_replaces_special_chars() {
        assert_eq!(sanitize_name("TASK-42"), "task-42");
        assert_eq!(sanitize_name("fix/bug #7"), "fix-bug--7");
        assert_eq!(sanitize_name("simple"), "simple");
    }

    #[test]
    fn worktree_path_construction() {
        let p = worktree_path(Path::new("/project"), "task-7");
        assert_eq!(p, PathBuf::from("/project/.orc/worktrees/task-7"));
    }

    #[test]
    fn worktree_info_serialization() {
        let info = WorktreeInfo {
            path: "/tmp/.orc/worktrees/task-1".into(),
            branch: "orc/task-1".into(),
            base_branch: "main".into(),
            task_id: "task-1".into(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&info).expect("serialize");
        let back: WorktreeInfo = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.path, info.path);
        assert_eq!(back.branch, info.branch);
    }

    #[tokio::test]
    async fn create_rejects_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let existing = worktree_path(dir.path(), "task-dup");
        std::fs::create_dir_all(&existing).unwrap();

        let result = WorktreeManager::create(dir.path(), "TASK-dup", "orc/", "main").await;
        assert!(matches!(result, Err(WorktreeError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn remove_rejects_nonexistent() {
        let dir = tempfile::tempdir().unwrap();
        let result = WorktreeManager::remove(dir.path(), "/nonexistent/path/xyz").await;
        assert!(matches!(result, Err(WorktreeError::NotFound(_))));
    }
}
