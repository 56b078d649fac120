//! End-to-end task lifecycle through the runner with a scripted agent.

use std::sync::Arc;
use std::time::Duration;

use orc_bridge::event_bus::EventBus;
use orc_bridge::protocol::EventKind;
use orc_core::types::{PhaseStatus, TaskCategory, TaskStatus, TaskWeight};
use orc_db::task_store::TaskStore;
use orc_db::transcript_store::TranscriptStore;
use orc_db::ProjectDb;
use orc_engine::invoker::{
    AgentOutcome, ConstitutionVerdict, GateVerdict, InvokeError, MockInvoker, ProposedSubtask,
};
use orc_engine::runner::{RunnerConfig, TaskRunner};
use orc_engine::EngineError;
use orc_prompts::PromptResolver;

struct Harness {
    _tmp: tempfile::TempDir,
    tasks: TaskStore,
    bus: EventBus,
    runner: TaskRunner,
}

async fn harness(script: Vec<Result<AgentOutcome, InvokeError>>) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let db = ProjectDb::open_in_memory().await.unwrap();
    let tasks = TaskStore::new(db.clone());
    let transcripts = TranscriptStore::new(db);
    let bus = EventBus::new();

    let mut config = RunnerConfig::new("proj-1", tmp.path());
    config.manage_worktrees = false;
    config.max_iterations = 3;
    config.retry_backoff = Duration::from_millis(1);

    let runner = TaskRunner::new(
        config,
        tasks.clone(),
        transcripts,
        bus.clone(),
        Arc::new(MockInvoker::new(script)),
        PromptResolver::new(),
    );
    Harness {
        _tmp: tmp,
        tasks,
        bus,
        runner,
    }
}

fn ok_outcome() -> Result<AgentOutcome, InvokeError> {
    Ok(AgentOutcome {
        success: true,
        response: "done".into(),
        ..AgentOutcome::default()
    })
}

#[tokio::test]
async fn trivial_task_runs_to_completion() {
    // Trivial pipeline: implement, review, finalize.
    let h = harness(vec![ok_outcome(), ok_outcome(), ok_outcome()]).await;
    let sub = h.bus.subscribe_all();

    let task = h
        .tasks
        .create_task("fix typo", None, TaskWeight::Trivial, TaskCategory::Docs)
        .await
        .unwrap();

    let phases = h.runner.plan(&task.id).await.unwrap();
    assert_eq!(phases, vec!["implement", "review", "finalize"]);
    assert_eq!(
        h.tasks.get_task(&task.id).await.unwrap().unwrap().status,
        TaskStatus::Planned
    );

    h.runner.run(&task.id).await.unwrap();

    let done = h.tasks.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.completed_at.is_some());
    assert!(done.current_phase.is_none());

    // Every phase completed with one iteration.
    for phase in phases {
        let state = h.tasks.get_phase(&task.id, phase).await.unwrap().unwrap();
        assert_eq!(state.status, PhaseStatus::Completed);
        assert_eq!(state.iterations, 1);
    }

    // The bus saw state, phase, gate, and complete events.
    let mut kinds = Vec::new();
    while let Some(ev) = sub.try_recv() {
        kinds.push(ev.event);
    }
    assert!(kinds.contains(&EventKind::State));
    assert!(kinds.contains(&EventKind::Phase));
    assert!(kinds.contains(&EventKind::Gate));
    assert!(kinds.contains(&EventKind::Complete));
}

#[tokio::test]
async fn transient_failure_retries_then_succeeds() {
    let h = harness(vec![
        Err(InvokeError::Process("connection reset".into())),
        ok_outcome(), // implement, attempt 2
        ok_outcome(), // review
        ok_outcome(), // finalize
    ])
    .await;

    let task = h
        .tasks
        .create_task("flaky agent", None, TaskWeight::Trivial, TaskCategory::Chore)
        .await
        .unwrap();
    h.runner.plan(&task.id).await.unwrap();
    h.runner.run(&task.id).await.unwrap();

    let state = h.tasks.get_phase(&task.id, "implement").await.unwrap().unwrap();
    assert_eq!(state.status, PhaseStatus::Completed);
    assert_eq!(state.iterations, 2);

    let iterations = h.tasks.list_iterations(&task.id, "implement").await.unwrap();
    assert_eq!(iterations.len(), 2);
    assert_eq!(
        iterations[0].outcome,
        Some(orc_core::types::IterationOutcome::Failed)
    );
    assert_eq!(
        iterations[1].outcome,
        Some(orc_core::types::IterationOutcome::Completed)
    );
}

#[tokio::test]
async fn persistent_failure_fails_the_task() {
    let h = harness(vec![
        Err(InvokeError::Timeout(Duration::from_secs(1))),
        Err(InvokeError::Timeout(Duration::from_secs(1))),
        Err(InvokeError::Timeout(Duration::from_secs(1))),
    ])
    .await;
    let sub = h.bus.subscribe_all();

    let task = h
        .tasks
        .create_task("doomed", None, TaskWeight::Trivial, TaskCategory::Bug)
        .await
        .unwrap();
    h.runner.plan(&task.id).await.unwrap();

    let err = h.runner.run(&task.id).await.unwrap_err();
    assert!(matches!(err, EngineError::PhaseExhausted { .. }));

    let failed = h.tasks.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.completed_at.is_some());

    let mut complete_failure = false;
    while let Some(ev) = sub.try_recv() {
        if ev.event == EventKind::Complete {
            complete_failure = ev.data["success"] == false;
        }
    }
    assert!(complete_failure, "expected a failure complete event");
}

#[tokio::test]
async fn rejected_gate_blocks_then_human_approval_resumes() {
    let h = harness(vec![
        Ok(AgentOutcome {
            success: true,
            response: "implemented".into(),
            gate: Some(GateVerdict {
                approved: false,
                rationale: Some("needs another look".into()),
            }),
            ..AgentOutcome::default()
        }),
        ok_outcome(), // review, after resume
        ok_outcome(), // finalize
    ])
    .await;

    let task = h
        .tasks
        .create_task("gated", None, TaskWeight::Trivial, TaskCategory::Feature)
        .await
        .unwrap();
    h.runner.plan(&task.id).await.unwrap();

    h.runner.run(&task.id).await.unwrap();
    assert_eq!(
        h.tasks.get_task(&task.id).await.unwrap().unwrap().status,
        TaskStatus::Blocked
    );

    // Resuming without approval blocks again immediately.
    h.runner.run(&task.id).await.unwrap();
    assert_eq!(
        h.tasks.get_task(&task.id).await.unwrap().unwrap().status,
        TaskStatus::Blocked
    );

    // Human approval is the new latest decision; resume completes the rest.
    h.runner
        .gates()
        .approve(&task.id, "implement", "sam", Some("looks fine".into()))
        .await
        .unwrap();
    h.runner.run(&task.id).await.unwrap();
    assert_eq!(
        h.tasks.get_task(&task.id).await.unwrap().unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn failed_constitution_check_blocks_spec_phase() {
    // Small pipeline starts with spec; the constitution exists and the
    // agent reports a violation.
    let h = harness(vec![Ok(AgentOutcome {
        success: true,
        response: "spec written".into(),
        constitution: Some(ConstitutionVerdict {
            passed: false,
            violations: vec!["removes an existing feature".into()],
        }),
        ..AgentOutcome::default()
    })])
    .await;

    let layout = orc_core::paths::ProjectLayout::new(h._tmp.path());
    orc_core::constitution::save_constitution(&layout, "# Rules\n1. Never remove features.\n")
        .await
        .unwrap();

    let task = h
        .tasks
        .create_task("against the rules", None, TaskWeight::Small, TaskCategory::Feature)
        .await
        .unwrap();
    h.runner.plan(&task.id).await.unwrap();
    h.runner.run(&task.id).await.unwrap();

    // The spec phase completed, but the auto gate vetoed the transition.
    assert_eq!(
        h.tasks.get_task(&task.id).await.unwrap().unwrap().status,
        TaskStatus::Blocked
    );
    let check = h
        .tasks
        .latest_constitution_check(&task.id, "spec")
        .await
        .unwrap()
        .unwrap();
    assert!(!check.passed);
    let gate = h.tasks.latest_gate(&task.id, "spec").await.unwrap().unwrap();
    assert!(!gate.approved);
}

#[tokio::test]
async fn proposals_land_in_the_queues() {
    let h = harness(vec![
        Ok(AgentOutcome {
            success: true,
            response: "done, with homework".into(),
            proposed_subtasks: vec![ProposedSubtask {
                title: "extract the retry helper".into(),
                description: None,
            }],
            proposed_knowledge: vec![orc_engine::invoker::ProposedKnowledge {
                kind: orc_core::types::KnowledgeKind::Gotcha,
                name: "sqlite busy".into(),
                description: "set busy_timeout before concurrent writes".into(),
            }],
            ..AgentOutcome::default()
        }),
        ok_outcome(),
        ok_outcome(),
    ])
    .await;

    let task = h
        .tasks
        .create_task("fruitful", None, TaskWeight::Trivial, TaskCategory::Refactor)
        .await
        .unwrap();
    h.runner.plan(&task.id).await.unwrap();
    h.runner.run(&task.id).await.unwrap();

    let subtasks = h.tasks.list_subtasks(&task.id, None).await.unwrap();
    assert_eq!(subtasks.len(), 1);
    assert_eq!(subtasks[0].title, "extract the retry helper");
    assert_eq!(subtasks[0].status, orc_core::types::SubtaskStatus::Pending);

    let knowledge = h.tasks.list_knowledge(None).await.unwrap();
    assert_eq!(knowledge.len(), 1);
    assert_eq!(knowledge[0].source_task.as_deref(), Some(task.id.as_str()));
}

#[tokio::test]
async fn run_from_created_is_invalid() {
    let h = harness(vec![]).await;
    let task = h
        .tasks
        .create_task("unplanned", None, TaskWeight::Trivial, TaskCategory::Chore)
        .await
        .unwrap();
    let err = h.runner.run(&task.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}
