use std::fmt;

use orc_core::types::TaskStatus;
use serde::{Deserialize, Serialize};

use crate::EngineError;

// ---------------------------------------------------------------------------
// TaskEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    Plan,
    Run,
    Complete,
    Fail,
    Block,
    Pause,
    Resume,
    Retry,
    Resolve,
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskEvent::Plan => "plan",
            TaskEvent::Run => "run",
            TaskEvent::Complete => "complete",
            TaskEvent::Fail => "fail",
            TaskEvent::Block => "block",
            TaskEvent::Pause => "pause",
            TaskEvent::Resume => "resume",
            TaskEvent::Retry => "retry",
            TaskEvent::Resolve => "resolve",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// TaskStateMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    current: TaskStatus,
    history: Vec<(TaskStatus, TaskEvent, TaskStatus)>,
}

impl TaskStateMachine {
    /// Start a fresh machine in `Created`.
    pub fn new() -> Self {
        Self::from_status(TaskStatus::Created)
    }

    /// Resume a machine from a persisted status.
    pub fn from_status(status: TaskStatus) -> Self {
        Self {
            current: status,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> TaskStatus {
        self.current
    }

    pub fn history(&self) -> &[(TaskStatus, TaskEvent, TaskStatus)] {
        &self.history
    }

    /// Attempt a transition driven by `event`.
    ///
    /// Valid transitions:
    /// - Created + Plan     -> Planned
    /// - Planned + Run      -> Running
    /// - Running + Complete -> Completed
    /// - Running + Fail     -> Failed
    /// - Running + Block    -> Blocked
    /// - Running + Pause    -> Paused
    /// - Blocked + Resume   -> Running
    /// - Paused  + Resume   -> Running
    /// - Failed  + Retry    -> Running
    /// - Failed  + Resolve  -> Resolved
    pub fn transition(&mut self, event: TaskEvent) -> Result<TaskStatus, EngineError> {
        let next = match (self.current, event) {
            (TaskStatus::Created, TaskEvent::Plan) => TaskStatus::Planned,
            (TaskStatus::Planned, TaskEvent::Run) => TaskStatus::Running,
            (TaskStatus::Running, TaskEvent::Complete) => TaskStatus::Completed,
            (TaskStatus::Running, TaskEvent::Fail) => TaskStatus::Failed,
            (TaskStatus::Running, TaskEvent::Block) => TaskStatus::Blocked,
            (TaskStatus::Running, TaskEvent::Pause) => TaskStatus::Paused,
            (TaskStatus::Blocked, TaskEvent::Resume) => TaskStatus::Running,
            (TaskStatus::Paused, TaskEvent::Resume) => TaskStatus::Running,
            (TaskStatus::Failed, TaskEvent::Retry) => TaskStatus::Running,
            (TaskStatus::Failed, TaskEvent::Resolve) => TaskStatus::Resolved,
            _ => {
                return Err(EngineError::InvalidTransition {
                    state: self.current,
                    event,
                });
            }
        };

        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "task state transition");
        Ok(next)
    }

    /// Returns `true` if the given event is valid in the current state.
    pub fn can_transition(&self, event: TaskEvent) -> bool {
        matches!(
            (self.current, event),
            (TaskStatus::Created, TaskEvent::Plan)
                | (TaskStatus::Planned, TaskEvent::Run)
                | (TaskStatus::Running, TaskEvent::Complete)
                | (TaskStatus::Running, TaskEvent::Fail)
                | (TaskStatus::Running, TaskEvent::Block)
                | (TaskStatus::Running, TaskEvent::Pause)
                | (TaskStatus::Blocked, TaskEvent::Resume)
                | (TaskStatus::Paused, TaskEvent::Resume)
                | (TaskStatus::Failed, TaskEvent::Retry)
                | (TaskStatus::Failed, TaskEvent::Resolve)
        )
    }
}

impl Default for TaskStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut sm = TaskStateMachine::new();
        sm.transition(TaskEvent::Plan).unwrap();
        sm.transition(TaskEvent::Run).unwrap();
        sm.transition(TaskEvent::Complete).unwrap();
        assert_eq!(sm.state(), TaskStatus::Completed);
        assert_eq!(sm.history().len(), 3);
    }

    #[test]
    fn block_and_resume() {
        let mut sm = TaskStateMachine::from_status(TaskStatus::Running);
        sm.transition(TaskEvent::Block).unwrap();
        assert_eq!(sm.state(), TaskStatus::Blocked);
        sm.transition(TaskEvent::Resume).unwrap();
        assert_eq!(sm.state(), TaskStatus::Running);
    }

    #[test]
    fn pause_and_resume() {
        let mut sm = TaskStateMachine::from_status(TaskStatus::Running);
        sm.transition(TaskEvent::Pause).unwrap();
        sm.transition(TaskEvent::Resume).unwrap();
        assert_eq!(sm.state(), TaskStatus::Running);
    }

    #[test]
    fn retry_from_failed() {
        let mut sm = TaskStateMachine::from_status(TaskStatus::Running);
        sm.transition(TaskEvent::Fail).unwrap();
        assert!(sm.can_transition(TaskEvent::Retry));
        sm.transition(TaskEvent::Retry).unwrap();
        assert_eq!(sm.state(), TaskStatus::Running);
    }

    #[test]
    fn resolve_from_failed() {
        let mut sm = TaskStateMachine::from_status(TaskStatus::Failed);
        sm.transition(TaskEvent::Resolve).unwrap();
        assert_eq!(sm.state(), TaskStatus::Resolved);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut sm = TaskStateMachine::new();
        let err = sm.transition(TaskEvent::Run).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(sm.state(), TaskStatus::Created);

        let mut done = TaskStateMachine::from_status(TaskStatus::Completed);
        assert!(done.transition(TaskEvent::Run).is_err());
        assert!(!done.can_transition(TaskEvent::Retry));
    }
}
