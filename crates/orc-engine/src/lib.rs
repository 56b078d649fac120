//! orc-engine -- the task lifecycle.
//!
//! Drives a task through its weight-selected phase pipeline: each phase
//! iterates the external agent inside the task's worktree, transcripts and
//! token counts flow into the stores, events flow out on the bus, and a gate
//! decision authorizes (or blocks) every phase transition. The finalize
//! controller runs the terminal merge workflow with stepwise progress.

pub mod finalize;
pub mod gates;
pub mod invoker;
pub mod pipeline;
pub mod planner;
pub mod runner;
pub mod state_machine;

pub use state_machine::{TaskEvent, TaskStateMachine};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition {
        state: orc_core::types::TaskStatus,
        event: state_machine::TaskEvent,
    },
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("phase {phase} exhausted after {iterations} iterations")]
    PhaseExhausted { phase: String, iterations: u32 },
    #[error("phase {0} already running for task")]
    PhaseAlreadyRunning(String),
    #[error("store error: {0}")]
    Store(#[from] orc_db::StoreError),
    #[error("prompt error: {0}")]
    Prompt(#[from] orc_prompts::PromptError),
    #[error("worktree error: {0}")]
    Worktree(#[from] orc_core::worktree::WorktreeError),
    #[error("constitution error: {0}")]
    Constitution(#[from] orc_core::constitution::ConstitutionError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
