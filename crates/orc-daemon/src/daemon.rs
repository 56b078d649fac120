use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use orc_bridge::event_bus::EventBus;
use orc_bridge::http_api::{router, ApiState};
use orc_core::config::OrcConfig;
use orc_core::paths::{GlobalLayout, ProjectLayout};
use orc_db::cost_store::CostStore;
use orc_db::task_store::TaskStore;
use orc_db::transcript_store::TranscriptStore;
use orc_db::{GlobalDb, ProjectDb};
use orc_engine::finalize::{FinalizeController, GitFinalizeSteps};
use orc_engine::invoker::SubprocessInvoker;
use orc_engine::runner::{RunnerConfig, TaskRunner};
use orc_initiatives::store::{GitCommitSettings, InitiativeStore};
use orc_prompts::PromptResolver;
use tracing::info;

/// The orc background daemon for one project: owns both databases, the
/// event bus, the task runner, and the finalize controller, and serves the
/// WebSocket event stream.
pub struct Daemon {
    config: OrcConfig,
    project_root: PathBuf,
    event_bus: EventBus,
    api_state: Arc<ApiState>,
    pub tasks: TaskStore,
    pub transcripts: TranscriptStore,
    pub costs: CostStore,
    pub initiatives: Arc<InitiativeStore>,
    pub runner: Arc<TaskRunner>,
    pub finalize: Arc<FinalizeController>,
}

impl Daemon {
    /// Open (or create) both databases under the standard layout and wire
    /// the engine together.
    pub async fn new(config: OrcConfig, project_root: PathBuf) -> Result<Self> {
        let project_layout = ProjectLayout::new(&project_root);
        let global_layout = GlobalLayout::from_home();

        tokio::fs::create_dir_all(project_layout.orc_dir())
            .await
            .context("failed to create .orc directory")?;
        tokio::fs::create_dir_all(global_layout.orc_dir())
            .await
            .context("failed to create ~/.orc directory")?;

        let project_db = ProjectDb::open(project_layout.db_path())
            .await
            .context("failed to open project database")?;
        let global_db = GlobalDb::open(global_layout.global_db_path())
            .await
            .context("failed to open global database")?;

        Self::with_databases(config, project_root, project_db, global_db)
    }

    /// Wire the daemon over explicit databases (tests use in-memory ones).
    pub fn with_databases(
        config: OrcConfig,
        project_root: PathBuf,
        project_db: ProjectDb,
        global_db: GlobalDb,
    ) -> Result<Self> {
        let project_layout = ProjectLayout::new(&project_root);
        let global_layout = GlobalLayout::from_home();
        let project_id = project_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());

        let event_bus = EventBus::new();
        let api_state = Arc::new(ApiState::new(event_bus.clone()));

        let tasks = TaskStore::new(project_db.clone());
        let transcripts = TranscriptStore::new(project_db.clone());
        let costs = CostStore::new(global_db);

        let mut initiatives = InitiativeStore::new(
            project_layout.initiatives_dir(config.general.team_mode),
        )
        .with_projection(project_db);
        if config.git.auto_commit_initiatives {
            initiatives = initiatives.with_git(GitCommitSettings {
                repo_root: project_root.clone(),
                commit_prefix: config.git.commit_prefix.clone(),
            });
        }
        let initiatives = Arc::new(initiatives);

        let resolver = PromptResolver::new()
            .with_personal_dir(global_layout.prompts_dir())
            .with_local_dir(global_layout.project_prompts_dir(&project_id))
            .with_project_dir(project_layout.prompts_dir());

        let runner_config = RunnerConfig {
            project: project_id.clone(),
            project_root: project_root.clone(),
            default_branch: config.general.default_branch.clone(),
            branch_prefix: config.general.branch_prefix.clone(),
            max_iterations: config.agent.max_iterations,
            retry_backoff: Duration::from_secs(config.agent.retry_backoff_secs),
            phase_timeout: Duration::from_secs(config.agent.phase_timeout_secs),
            model: config.agent.model.clone(),
            manage_worktrees: true,
        };
        let invoker = Arc::new(SubprocessInvoker::new(&config.agent.command));
        let runner = Arc::new(
            TaskRunner::new(
                runner_config,
                tasks.clone(),
                transcripts.clone(),
                event_bus.clone(),
                invoker,
                resolver,
            )
            .with_costs(costs.clone())
            .with_initiatives(initiatives.clone()),
        );

        let finalize_steps = GitFinalizeSteps {
            project_root: project_root.clone(),
            target_branch: config.general.default_branch.clone(),
            branch_prefix: config.general.branch_prefix.clone(),
            test_command: None,
        };
        let finalize = Arc::new(FinalizeController::new(
            project_id,
            config.general.default_branch.clone(),
            event_bus.clone(),
            Arc::new(finalize_steps),
        ));

        Ok(Self {
            config,
            project_root,
            event_bus,
            api_state,
            tasks,
            transcripts,
            costs,
            initiatives,
            runner,
            finalize,
        })
    }

    pub fn config(&self) -> &OrcConfig {
        &self.config
    }

    pub fn project_root(&self) -> &PathBuf {
        &self.project_root
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Serve the HTTP/WS surface on the given listener until ctrl-c.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let app = router(self.api_state.clone());
        info!(addr = %listener.local_addr()?, "serving event stream");
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("ctrl-c received, shutting down");
            })
            .await
            .context("server error")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
