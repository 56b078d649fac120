//! Finalize controller: stepwise progress, retry semantics, and event
//! publication.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use orc_bridge::event_bus::EventBus;
use orc_bridge::protocol::EventKind;
use orc_engine::finalize::{
    FinalizeController, FinalizeError, FinalizeState, FinalizeStatus, FinalizeSteps, RiskLevel,
};

/// Scripted steps: fails at the named step for the first `fail_times`
/// triggers, then succeeds.
struct ScriptedSteps {
    fail_at: Option<&'static str>,
    fail_times: AtomicU32,
    tests_pass: bool,
}

impl ScriptedSteps {
    fn all_ok() -> Self {
        Self {
            fail_at: None,
            fail_times: AtomicU32::new(0),
            tests_pass: true,
        }
    }

    fn failing_once_at(step: &'static str) -> Self {
        Self {
            fail_at: Some(step),
            fail_times: AtomicU32::new(1),
            tests_pass: true,
        }
    }

    fn should_fail(&self, step: &str) -> bool {
        if self.fail_at != Some(step) {
            return false;
        }
        self.fail_times
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl FinalizeSteps for ScriptedSteps {
    async fn sync(&self, _task: &str) -> Result<(), String> {
        if self.should_fail("sync") {
            return Err("cannot fast-forward".into());
        }
        Ok(())
    }

    async fn resolve_conflicts(&self, _task: &str) -> Result<u32, String> {
        if self.should_fail("resolve") {
            return Err("conflict storm".into());
        }
        Ok(2)
    }

    async fn run_tests(&self, _task: &str) -> Result<bool, String> {
        if self.should_fail("test") {
            return Err("test runner crashed".into());
        }
        Ok(self.tests_pass)
    }

    async fn assess_risk(&self, _task: &str) -> Result<RiskLevel, String> {
        Ok(RiskLevel::Medium)
    }

    async fn merge(&self, _task: &str) -> Result<(String, u32), String> {
        Ok(("abc123".into(), 9))
    }
}

fn controller(steps: ScriptedSteps) -> (FinalizeController, EventBus) {
    let bus = EventBus::new();
    let controller = FinalizeController::new("proj-1", "main", bus.clone(), Arc::new(steps));
    (controller, bus)
}

#[tokio::test]
async fn successful_workflow_reports_every_step() {
    let (controller, bus) = controller(ScriptedSteps::all_ok());
    let sub = bus.subscribe_all();

    let result = controller.trigger("TASK-1").await.unwrap();
    assert_eq!(result.commit_sha.as_deref(), Some("abc123"));
    assert_eq!(result.target_branch, "main");
    assert_eq!(result.files_changed, 9);
    assert_eq!(result.conflicts_resolved, 2);
    assert!(result.tests_passed);

    let state = controller.state("TASK-1");
    assert_eq!(state.status, FinalizeStatus::Completed);
    assert_eq!(state.step_percent, 100);
    assert!(state.error.is_none());

    // Finalize events walked through every named step with increasing
    // progress.
    let mut steps_seen = Vec::new();
    let mut percents = Vec::new();
    while let Some(ev) = sub.try_recv() {
        assert_eq!(ev.event, EventKind::Finalize);
        let state: FinalizeState = serde_json::from_value(ev.data.clone()).unwrap();
        if let Some(step) = state.step {
            steps_seen.push(step);
        }
        percents.push(state.step_percent);
    }
    for expected in ["sync", "resolve", "test", "risk", "merge"] {
        assert!(steps_seen.iter().any(|s| s == expected), "missing {expected}");
    }
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.last(), Some(&100));
}

#[tokio::test]
async fn failure_records_error_and_allows_retry() {
    let (controller, _bus) = controller(ScriptedSteps::failing_once_at("test"));

    let err = controller.trigger("TASK-1").await.unwrap_err();
    assert!(matches!(err, FinalizeError::Step { step: "test", .. }));

    let state = controller.state("TASK-1");
    assert_eq!(state.status, FinalizeStatus::Failed);
    assert!(state.error.unwrap().contains("test runner crashed"));

    // A failed run may be retriggered and now succeeds.
    let result = controller.trigger("TASK-1").await.unwrap();
    assert!(result.tests_passed);
    assert_eq!(controller.state("TASK-1").status, FinalizeStatus::Completed);
}

#[tokio::test]
async fn completed_workflow_rejects_retrigger() {
    let (controller, _bus) = controller(ScriptedSteps::all_ok());
    controller.trigger("TASK-1").await.unwrap();

    let err = controller.trigger("TASK-1").await.unwrap_err();
    assert!(matches!(
        err,
        FinalizeError::AlreadyActive(FinalizeStatus::Completed)
    ));
}

#[tokio::test]
async fn failing_tests_fail_the_workflow() {
    let steps = ScriptedSteps {
        fail_at: None,
        fail_times: AtomicU32::new(0),
        tests_pass: false,
    };
    let (controller, _bus) = controller(steps);

    let err = controller.trigger("TASK-1").await.unwrap_err();
    assert!(matches!(err, FinalizeError::Step { step: "test", .. }));
    assert_eq!(controller.state("TASK-1").status, FinalizeStatus::Failed);
}

#[tokio::test]
async fn unknown_task_state_is_not_started() {
    let (controller, _bus) = controller(ScriptedSteps::all_ok());
    let state = controller.state("TASK-404");
    assert_eq!(state.status, FinalizeStatus::NotStarted);
}
