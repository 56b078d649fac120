use std::path::Path;

use tokio::process::Command;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git {args}: {stderr}")]
    Command { args: String, stderr: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GitError>;

// ---------------------------------------------------------------------------
// Subprocess wrapper
// ---------------------------------------------------------------------------

/// Run `git -C <root> <args...>` and return trimmed stdout.
pub async fn run_git(root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(args)
        .output()
        .await?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Err(GitError::Command {
            args: args.join(" "),
            stderr,
        })
    }
}

/// Stage the given paths and commit. A commit that finds nothing to do is
/// treated as success and returns `Ok(false)`.
pub async fn commit_paths(root: &Path, paths: &[&str], message: &str) -> Result<bool> {
    run_git(root, &[&["add", "--"][..], paths].concat()).await?;

    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(["commit", "-m", message])
        .output()
        .await?;

    if output.status.success() {
        return Ok(true);
    }

    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    if is_noop_commit(&combined) {
        return Ok(false);
    }
    Err(GitError::Command {
        args: format!("commit -m {message}"),
        stderr: combined,
    })
}

/// Current commit sha of HEAD.
pub async fn head_sha(root: &Path) -> Result<String> {
    run_git(root, &["rev-parse", "HEAD"]).await
}

/// Git reports empty commits on stdout; both phrasings mean "no work".
fn is_noop_commit(output: &str) -> bool {
    output.contains("nothing to commit") || output.contains("no changes added")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_commit_detection() {
        assert!(is_noop_commit("On branch main\nnothing to commit, working tree clean\n"));
        assert!(is_noop_commit("no changes added to commit\n"));
        assert!(!is_noop_commit("1 file changed, 2 insertions(+)\n"));
    }

    #[tokio::test]
    async fn run_git_in_non_repo_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_git(dir.path(), &["status"]).await;
        // Either git is missing (Io) or it refuses the directory (Command).
        assert!(result.is_err());
    }
}
