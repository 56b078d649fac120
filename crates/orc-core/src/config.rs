use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.orc/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrcConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
}

impl OrcConfig {
    /// Load config from `~/.orc/config.toml`, falling back to defaults when
    /// the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(OrcConfig::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: OrcConfig = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".orc")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Default merge target when no initiative overrides it.
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// Prefix for task branches, e.g. `orc/task-7`.
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Team mode stores initiatives under `.orc/shared/initiatives`.
    #[serde(default)]
    pub team_mode: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            default_branch: default_branch(),
            branch_prefix: default_branch_prefix(),
            team_mode: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_branch() -> String {
    "main".into()
}

fn default_branch_prefix() -> String {
    "orc/".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    7430
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Executable invoked per phase iteration.
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Per-phase wall-clock timeout for one agent invocation.
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,
    /// Maximum iterations per phase before the phase fails.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Base backoff between retried iterations.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            model: None,
            phase_timeout_secs: default_phase_timeout_secs(),
            max_iterations: default_max_iterations(),
            retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

fn default_agent_command() -> String {
    "claude".into()
}

fn default_phase_timeout_secs() -> u64 {
    1800
}

fn default_max_iterations() -> u32 {
    3
}

fn default_retry_backoff_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Environment variable holding the hosting token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Commit initiative YAML files automatically on save/delete.
    #[serde(default)]
    pub auto_commit_initiatives: bool,
    /// Message prefix for automatic commits.
    #[serde(default = "default_commit_prefix")]
    pub commit_prefix: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            auto_commit_initiatives: false,
            commit_prefix: default_commit_prefix(),
        }
    }
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".into()
}

fn default_commit_prefix() -> String {
    "orc:".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// Days after which an approved, unvalidated entry is considered stale.
    #[serde(default = "default_staleness_days")]
    pub staleness_days: i64,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            staleness_days: default_staleness_days(),
        }
    }
}

fn default_staleness_days() -> i64 {
    30
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
