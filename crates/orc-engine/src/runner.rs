//! The task runner: plans a pipeline for a task, then drives the external
//! agent through each phase with iteration, retry, gating, and telemetry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use orc_bridge::event_bus::EventBus;
use orc_bridge::protocol::{OrcEvent, TokensDelta};
use orc_core::constitution::load_constitution;
use orc_core::paths::ProjectLayout;
use orc_core::types::{
    GateType, IterationOutcome, KnowledgeEntry, KnowledgeScope, PhaseState, PhaseStatus, Subtask,
    Task, TaskStatus,
};
use orc_core::worktree::WorktreeManager;
use orc_db::cost_store::{CostEntry, CostStore};
use orc_db::task_store::TaskStore;
use orc_db::transcript_store::TranscriptStore;
use orc_initiatives::InitiativeStore;
use orc_prompts::PromptResolver;

use crate::gates::GateKeeper;
use crate::invoker::{AgentInvoker, AgentOutcome, AgentRequest, InvokeError};
use crate::pipeline::{is_spec_like, phases_for_weight};
use crate::state_machine::{TaskEvent, TaskStateMachine};
use crate::{EngineError, Result};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Project identifier used on events and cost entries.
    pub project: String,
    pub project_root: PathBuf,
    /// Merge target when no initiative overrides it.
    pub default_branch: String,
    /// Prefix for task branches, e.g. `orc/`.
    pub branch_prefix: String,
    pub max_iterations: u32,
    pub retry_backoff: Duration,
    pub phase_timeout: Duration,
    pub model: Option<String>,
    /// When false, the runner skips git worktree management and runs the
    /// agent in the project root (tests, direct mode).
    pub manage_worktrees: bool,
}

impl RunnerConfig {
    pub fn new(project: impl Into<String>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            project: project.into(),
            project_root: project_root.into(),
            default_branch: "main".into(),
            branch_prefix: "orc/".into(),
            max_iterations: 3,
            retry_backoff: Duration::from_secs(5),
            phase_timeout: Duration::from_secs(1800),
            model: None,
            manage_worktrees: true,
        }
    }
}

// ---------------------------------------------------------------------------
// TaskRunner
// ---------------------------------------------------------------------------

pub struct TaskRunner {
    config: RunnerConfig,
    tasks: TaskStore,
    transcripts: TranscriptStore,
    costs: Option<CostStore>,
    initiatives: Option<Arc<InitiativeStore>>,
    gates: GateKeeper,
    bus: EventBus,
    invoker: Arc<dyn AgentInvoker>,
    resolver: PromptResolver,
}

impl TaskRunner {
    pub fn new(
        config: RunnerConfig,
        tasks: TaskStore,
        transcripts: TranscriptStore,
        bus: EventBus,
        invoker: Arc<dyn AgentInvoker>,
        resolver: PromptResolver,
    ) -> Self {
        let gates = GateKeeper::new(tasks.clone());
        Self {
            config,
            tasks,
            transcripts,
            costs: None,
            initiatives: None,
            gates,
            bus,
            invoker,
            resolver,
        }
    }

    /// Attach the global cost store; without it cost telemetry is skipped.
    pub fn with_costs(mut self, costs: CostStore) -> Self {
        self.costs = Some(costs);
        self
    }

    /// Attach the initiative store so tasks inside an initiative pick up its
    /// branch policy (`branch_base` target, `branch_prefix`).
    pub fn with_initiatives(mut self, initiatives: Arc<InitiativeStore>) -> Self {
        self.initiatives = Some(initiatives);
        self
    }

    pub fn gates(&self) -> &GateKeeper {
        &self.gates
    }

    // -----------------------------------------------------------------------
    // Plan
    // -----------------------------------------------------------------------

    /// Select the phase pipeline for the task's weight, seed pending phase
    /// rows, and move the task to `planned`.
    pub async fn plan(&self, task_id: &str) -> Result<Vec<&'static str>> {
        let task = self.get_task(task_id).await?;
        let mut machine = TaskStateMachine::from_status(task.status);
        machine.transition(TaskEvent::Plan)?;

        let phases = phases_for_weight(task.weight);
        for phase in &phases {
            self.tasks
                .upsert_phase(&PhaseState {
                    task_id: task.id.clone(),
                    phase: phase.to_string(),
                    status: PhaseStatus::Pending,
                    started_at: None,
                    completed_at: None,
                    iterations: 0,
                })
                .await?;
        }

        self.set_status(&task.id, machine.state()).await?;
        tracing::info!(task = %task.id, ?phases, "task planned");
        Ok(phases)
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    /// Run the task's pipeline to completion, blocking, or failure.
    /// Valid from `planned` (first run), `blocked`/`paused` (resume), and
    /// `failed` (retry).
    pub async fn run(&self, task_id: &str) -> Result<()> {
        let task = self.get_task(task_id).await?;
        let event = match task.status {
            TaskStatus::Planned => TaskEvent::Run,
            TaskStatus::Blocked | TaskStatus::Paused => TaskEvent::Resume,
            TaskStatus::Failed => TaskEvent::Retry,
            _ => {
                return Err(EngineError::InvalidTransition {
                    state: task.status,
                    event: TaskEvent::Run,
                })
            }
        };
        let mut machine = TaskStateMachine::from_status(task.status);
        machine.transition(event)?;
        self.set_status(&task.id, machine.state()).await?;

        if let Some(model) = &self.config.model {
            self.tasks.set_session_model(&task.id, model).await?;
        }

        let workdir = self.ensure_workdir(&task).await?;

        for phase in phases_for_weight(task.weight) {
            let already_completed = matches!(
                self.tasks.get_phase(&task.id, phase).await?,
                Some(state) if state.status == PhaseStatus::Completed
            );
            if already_completed {
                // The latest decision still rules on resume. Auto gates are
                // re-evaluated so a later passing constitution check lifts
                // the block; human and AI rejections stand until overridden.
                match self.tasks.latest_gate(&task.id, phase).await? {
                    None => {
                        self.gates.record_auto_gate(&task.id, phase).await?;
                    }
                    Some(gate) if !gate.approved && gate.gate_type == GateType::Auto => {
                        self.gates.record_auto_gate(&task.id, phase).await?;
                    }
                    Some(_) => {}
                }
                if !self.gates.can_advance(&task.id, phase).await? {
                    self.set_status(&task.id, TaskStatus::Blocked).await?;
                    return Ok(());
                }
                continue;
            }

            let outcome = match self.run_phase(&task, phase, &workdir).await {
                Ok(outcome) => outcome,
                Err(err @ EngineError::PhaseExhausted { .. }) => {
                    self.set_status(&task.id, TaskStatus::Failed).await?;
                    self.bus.publish(OrcEvent::complete(
                        &self.config.project,
                        &task.id,
                        false,
                        serde_json::json!({ "phase": phase, "error": err.to_string() }),
                    ));
                    return Err(err);
                }
                Err(other) => return Err(other),
            };

            // Gate the transition: AI verdict when the agent produced one,
            // system auto-gate otherwise.
            let decision = match &outcome.gate {
                Some(verdict) => self.gates.record_ai_gate(&task.id, phase, verdict).await?,
                None => self.gates.record_auto_gate(&task.id, phase).await?,
            };
            self.bus.publish(OrcEvent::gate(
                &self.config.project,
                &task.id,
                phase,
                decision.approved,
            ));

            if !self.gates.can_advance(&task.id, phase).await? {
                self.set_status(&task.id, TaskStatus::Blocked).await?;
                tracing::warn!(task = %task.id, phase, "gate rejected; task blocked");
                return Ok(());
            }
        }

        self.tasks.set_current_phase(&task.id, None).await?;
        self.set_status(&task.id, TaskStatus::Completed).await?;
        self.bus.publish(OrcEvent::complete(
            &self.config.project,
            &task.id,
            true,
            serde_json::json!({}),
        ));
        tracing::info!(task = %task.id, "task completed");
        Ok(())
    }

    /// Pause a running task; `run` resumes it.
    pub async fn pause(&self, task_id: &str) -> Result<()> {
        let task = self.get_task(task_id).await?;
        let mut machine = TaskStateMachine::from_status(task.status);
        machine.transition(TaskEvent::Pause)?;
        self.set_status(&task.id, machine.state()).await
    }

    // -----------------------------------------------------------------------
    // Phase execution
    // -----------------------------------------------------------------------

    /// One phase: iterate the agent up to `max_iterations` with backoff on
    /// transient failures, ingesting transcripts and telemetry as they come.
    async fn run_phase(&self, task: &Task, phase: &str, workdir: &Path) -> Result<AgentOutcome> {
        if self.tasks.running_phase_count(&task.id).await? > 0 {
            return Err(EngineError::PhaseAlreadyRunning(phase.to_string()));
        }

        self.tasks
            .upsert_phase(&PhaseState {
                task_id: task.id.clone(),
                phase: phase.to_string(),
                status: PhaseStatus::Running,
                started_at: Some(chrono::Utc::now()),
                completed_at: None,
                iterations: 0,
            })
            .await?;
        self.tasks.set_current_phase(&task.id, Some(phase)).await?;
        self.bus
            .publish(OrcEvent::phase(&self.config.project, &task.id, phase, "running"));

        let prompt_text = self.render_prompt(task, phase).await?;

        let mut last_error: Option<InvokeError> = None;
        for attempt in 1..=self.config.max_iterations {
            let iteration = self
                .tasks
                .start_iteration(&task.id, phase, Some(format!("{phase}.md")))
                .await?;

            let request = AgentRequest {
                task_id: task.id.clone(),
                phase: phase.to_string(),
                iteration: iteration.seq,
                prompt: prompt_text.clone(),
                model: self.config.model.clone(),
                workdir: workdir.to_path_buf(),
                timeout: self.config.phase_timeout,
            };

            match self.invoker.invoke(&request).await {
                Ok(outcome) => {
                    self.ingest_outcome(task, phase, iteration.seq, &outcome).await?;
                    self.tasks
                        .finish_iteration(
                            &task.id,
                            phase,
                            iteration.seq,
                            IterationOutcome::Completed,
                            None,
                        )
                        .await?;

                    if outcome.success {
                        self.tasks
                            .upsert_phase(&PhaseState {
                                task_id: task.id.clone(),
                                phase: phase.to_string(),
                                status: PhaseStatus::Completed,
                                started_at: None,
                                completed_at: Some(chrono::Utc::now()),
                                iterations: iteration.seq,
                            })
                            .await?;
                        self.bus.publish(OrcEvent::phase(
                            &self.config.project,
                            &task.id,
                            phase,
                            "completed",
                        ));
                        return Ok(outcome);
                    }
                    tracing::warn!(task = %task.id, phase, attempt, "agent reported failure");
                    last_error = Some(InvokeError::Failed(outcome.response.clone()));
                }
                Err(InvokeError::Timeout(t)) => {
                    tracing::warn!(task = %task.id, phase, attempt, timeout = ?t, "iteration timed out");
                    self.tasks
                        .finish_iteration(&task.id, phase, iteration.seq, IterationOutcome::TimedOut, None)
                        .await?;
                    last_error = Some(InvokeError::Timeout(t));
                }
                Err(err) => {
                    tracing::warn!(task = %task.id, phase, attempt, error = %err, "iteration failed");
                    self.tasks
                        .finish_iteration(&task.id, phase, iteration.seq, IterationOutcome::Failed, None)
                        .await?;
                    last_error = Some(err);
                }
            }

            if attempt < self.config.max_iterations {
                tokio::time::sleep(self.config.retry_backoff * attempt).await;
            }
        }

        self.tasks
            .upsert_phase(&PhaseState {
                task_id: task.id.clone(),
                phase: phase.to_string(),
                status: PhaseStatus::Failed,
                started_at: None,
                completed_at: Some(chrono::Utc::now()),
                iterations: self.config.max_iterations,
            })
            .await?;
        self.bus
            .publish(OrcEvent::phase(&self.config.project, &task.id, phase, "failed"));

        tracing::error!(
            task = %task.id,
            phase,
            error = ?last_error,
            "phase exhausted its iteration budget"
        );
        Err(EngineError::PhaseExhausted {
            phase: phase.to_string(),
            iterations: self.config.max_iterations,
        })
    }

    /// Persist everything an invocation produced: transcripts, tokens,
    /// cost, proposals, and the constitution verdict for spec-like phases.
    async fn ingest_outcome(
        &self,
        task: &Task,
        phase: &str,
        iteration: u32,
        outcome: &AgentOutcome,
    ) -> Result<()> {
        if !outcome.transcripts.is_empty() {
            self.transcripts.add_batch(outcome.transcripts.clone()).await?;
            self.bus.publish(OrcEvent::transcript_response(
                &self.config.project,
                &task.id,
                phase,
            ));
        }

        if outcome.tokens.total() > 0 {
            let delta: TokensDelta = outcome.tokens.into();
            self.bus
                .publish(OrcEvent::tokens(&self.config.project, &task.id, &delta));
        }

        if let Some(costs) = &self.costs {
            if outcome.cost_usd > 0.0 || outcome.tokens.total() > 0 {
                costs
                    .record_cost_extended(&CostEntry {
                        project_id: self.config.project.clone(),
                        task_id: task.id.clone(),
                        phase: phase.to_string(),
                        model: self.config.model.clone().unwrap_or_default(),
                        iteration: Some(iteration),
                        cost_usd: outcome.cost_usd,
                        input_tokens: outcome.tokens.input,
                        output_tokens: outcome.tokens.output,
                        cache_creation_tokens: outcome.tokens.cache_creation,
                        cache_read_tokens: outcome.tokens.cache_read,
                        total_tokens: outcome.tokens.total(),
                        initiative_id: task.initiative_id.clone(),
                        duration_ms: outcome.duration_ms,
                        timestamp: chrono::Utc::now(),
                    })
                    .await?;
            }
        }

        for proposed in &outcome.proposed_subtasks {
            let mut subtask = Subtask::new(&task.id, &proposed.title);
            subtask.description = proposed.description.clone();
            subtask.proposed_by = Some(format!("agent:{phase}"));
            self.tasks.propose_subtask(&subtask).await?;
        }

        for proposed in &outcome.proposed_knowledge {
            let mut entry = KnowledgeEntry::new(proposed.kind, &proposed.name, &proposed.description);
            entry.scope = KnowledgeScope::Project;
            entry.source_task = Some(task.id.clone());
            self.tasks.propose_knowledge(&entry).await?;
        }

        if is_spec_like(phase) {
            if let Some(verdict) = &outcome.constitution {
                let layout = ProjectLayout::new(&self.config.project_root);
                if load_constitution(&layout).await?.is_some() {
                    self.tasks
                        .record_constitution_check(
                            &task.id,
                            phase,
                            verdict.passed,
                            verdict.violations.clone(),
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
    }

    async fn set_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        self.tasks.update_task_status(task_id, status).await?;
        self.bus
            .publish(OrcEvent::state(&self.config.project, task_id, status.as_str()));
        Ok(())
    }

    /// Branch policy for a task: the initiative's `branch_base`/`branch_prefix`
    /// when it belongs to one, the project defaults otherwise.
    async fn branch_policy(&self, task: &Task) -> (String, String) {
        if let (Some(store), Some(init_id)) = (&self.initiatives, &task.initiative_id) {
            match store.load(init_id).await {
                Ok(initiative) => {
                    let base = initiative
                        .branch_base
                        .unwrap_or_else(|| self.config.default_branch.clone());
                    let prefix = initiative
                        .branch_prefix
                        .unwrap_or_else(|| self.config.branch_prefix.clone());
                    return (base, prefix);
                }
                Err(e) => {
                    tracing::warn!(task = %task.id, initiative = %init_id, error = %e,
                        "initiative unavailable; using project branch defaults");
                }
            }
        }
        (
            self.config.default_branch.clone(),
            self.config.branch_prefix.clone(),
        )
    }

    /// Create the task's worktree and branch on first run; reuse after.
    async fn ensure_workdir(&self, task: &Task) -> Result<PathBuf> {
        if !self.config.manage_worktrees {
            return Ok(self.config.project_root.clone());
        }
        if let Some(branch) = &task.branch {
            let existing = WorktreeManager::list(&self.config.project_root).await?;
            if let Some(info) = existing.iter().find(|w| &w.branch == branch) {
                return Ok(PathBuf::from(&info.path));
            }
        }
        let (base_branch, branch_prefix) = self.branch_policy(task).await;
        let info = WorktreeManager::create(
            &self.config.project_root,
            &task.id,
            &branch_prefix,
            &base_branch,
        )
        .await?;
        self.tasks.set_task_branch(&task.id, &info.branch).await?;
        Ok(PathBuf::from(info.path))
    }

    async fn render_prompt(&self, task: &Task, phase: &str) -> Result<String> {
        let resolved = self.resolver.resolve(phase)?;
        let (target_branch, branch_prefix) = self.branch_policy(task).await;
        let mut vars = HashMap::new();
        vars.insert("task_id".to_string(), task.id.clone());
        vars.insert("title".to_string(), task.title.clone());
        vars.insert(
            "description".to_string(),
            task.description.clone().unwrap_or_default(),
        );
        vars.insert(
            "branch".to_string(),
            task.branch
                .clone()
                .unwrap_or_else(|| format!("{branch_prefix}{}", task.id.to_lowercase())),
        );
        vars.insert("target_branch".to_string(), target_branch);
        vars.insert("phase".to_string(), phase.to_string());
        Ok(resolved.render(&vars))
    }
}
