use std::path::{Path, PathBuf};

/// On-disk layout of a project's `.orc/` directory.
///
/// ```text
/// <project>/.orc/
/// ├── CONSTITUTION.md
/// ├── initiatives/<INIT-id>/initiative.yaml
/// ├── shared/initiatives/<INIT-id>/initiative.yaml   (team mode)
/// ├── prompts/<phase>.md
/// ├── worktrees/<task>/
/// └── orc.db
/// ```
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            root: project_root.into(),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.root
    }

    pub fn orc_dir(&self) -> PathBuf {
        self.root.join(".orc")
    }

    pub fn constitution_path(&self) -> PathBuf {
        self.orc_dir().join("CONSTITUTION.md")
    }

    /// Base directory for initiative YAML files. Team mode shares them
    /// through the repository instead of keeping them solo-local.
    pub fn initiatives_dir(&self, team_mode: bool) -> PathBuf {
        if team_mode {
            self.orc_dir().join("shared").join("initiatives")
        } else {
            self.orc_dir().join("initiatives")
        }
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.orc_dir().join("prompts")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.orc_dir().join("worktrees")
    }

    pub fn db_path(&self) -> PathBuf {
        self.orc_dir().join("orc.db")
    }
}

/// On-disk layout of the per-user `~/.orc/` directory.
#[derive(Debug, Clone)]
pub struct GlobalLayout {
    home: PathBuf,
}

impl GlobalLayout {
    /// Layout under the real home directory.
    pub fn from_home() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home)
    }

    /// Layout under an explicit base directory (useful for tests).
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn orc_dir(&self) -> PathBuf {
        self.home.join(".orc")
    }

    pub fn config_path(&self) -> PathBuf {
        self.orc_dir().join("config.toml")
    }

    /// Personal prompt overrides, highest priority in resolution.
    pub fn prompts_dir(&self) -> PathBuf {
        self.orc_dir().join("prompts")
    }

    /// Per-project personal prompt overrides.
    pub fn project_prompts_dir(&self, project_id: &str) -> PathBuf {
        self.orc_dir()
            .join("projects")
            .join(project_id)
            .join("prompts")
    }

    /// Host-wide cost telemetry database.
    pub fn global_db_path(&self) -> PathBuf {
        self.orc_dir().join("global.db")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
