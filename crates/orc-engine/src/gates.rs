//! Gate policy: every phase transition is authorized by the latest recorded
//! decision for that `(task, phase)`.
//!
//! Auto gates are system-recorded and approve unless the latest constitution
//! check for the phase failed. AI gates take their verdict from the agent's
//! structured output. Human gates wait for an explicit approval call.

use orc_core::types::{GateDecision, GateType};
use orc_db::task_store::TaskStore;

use crate::invoker::GateVerdict;
use crate::Result;

#[derive(Clone)]
pub struct GateKeeper {
    store: TaskStore,
}

impl GateKeeper {
    pub fn new(store: TaskStore) -> Self {
        Self { store }
    }

    /// System gate: approved unless a failed constitution check stands for
    /// this `(task, phase)`.
    pub async fn record_auto_gate(&self, task: &str, phase: &str) -> Result<GateDecision> {
        let check = self.store.latest_constitution_check(task, phase).await?;
        let (approved, rationale) = match check {
            Some(check) if !check.passed => (
                false,
                Some(format!(
                    "constitution check failed: {}",
                    check.violations.join("; ")
                )),
            ),
            _ => (true, None),
        };
        let decision = self
            .store
            .record_gate(task, phase, GateType::Auto, approved, rationale, Some("system".into()))
            .await?;
        Ok(decision)
    }

    /// Gate recorded from an agent's structured verdict.
    pub async fn record_ai_gate(
        &self,
        task: &str,
        phase: &str,
        verdict: &GateVerdict,
    ) -> Result<GateDecision> {
        let decision = self
            .store
            .record_gate(
                task,
                phase,
                GateType::Ai,
                verdict.approved,
                verdict.rationale.clone(),
                Some("agent".into()),
            )
            .await?;
        Ok(decision)
    }

    /// Explicit human approval.
    pub async fn approve(
        &self,
        task: &str,
        phase: &str,
        by: &str,
        rationale: Option<String>,
    ) -> Result<GateDecision> {
        let decision = self
            .store
            .record_gate(task, phase, GateType::Human, true, rationale, Some(by.into()))
            .await?;
        Ok(decision)
    }

    /// Explicit human rejection.
    pub async fn reject(
        &self,
        task: &str,
        phase: &str,
        by: &str,
        rationale: Option<String>,
    ) -> Result<GateDecision> {
        let decision = self
            .store
            .record_gate(task, phase, GateType::Human, false, rationale, Some(by.into()))
            .await?;
        Ok(decision)
    }

    /// Transition eligibility: only the latest decision counts; no decision
    /// at all means the phase has not been gated yet.
    pub async fn can_advance(&self, task: &str, phase: &str) -> Result<bool> {
        Ok(self
            .store
            .latest_gate(task, phase)
            .await?
            .map(|g| g.approved)
            .unwrap_or(false))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use orc_db::ProjectDb;

    async fn keeper() -> (GateKeeper, TaskStore) {
        let db = ProjectDb::open_in_memory().await.unwrap();
        let store = TaskStore::new(db);
        (GateKeeper::new(store.clone()), store)
    }

    #[tokio::test]
    async fn auto_gate_approves_by_default() {
        let (keeper, _) = keeper().await;
        let decision = keeper.record_auto_gate("TASK-1", "implement").await.unwrap();
        assert!(decision.approved);
        assert_eq!(decision.gate_type, GateType::Auto);
        assert!(keeper.can_advance("TASK-1", "implement").await.unwrap());
    }

    #[tokio::test]
    async fn auto_gate_blocks_on_failed_constitution() {
        let (keeper, store) = keeper().await;
        store
            .record_constitution_check("TASK-1", "spec", false, vec!["rule 2 violated".into()])
            .await
            .unwrap();

        let decision = keeper.record_auto_gate("TASK-1", "spec").await.unwrap();
        assert!(!decision.approved);
        assert!(decision.rationale.unwrap().contains("rule 2 violated"));
        assert!(!keeper.can_advance("TASK-1", "spec").await.unwrap());

        // A subsequent passing check lifts the veto.
        store
            .record_constitution_check("TASK-1", "spec", true, vec![])
            .await
            .unwrap();
        let decision = keeper.record_auto_gate("TASK-1", "spec").await.unwrap();
        assert!(decision.approved);
        assert!(keeper.can_advance("TASK-1", "spec").await.unwrap());
    }

    #[tokio::test]
    async fn human_rejection_then_approval() {
        let (keeper, _) = keeper().await;
        keeper
            .reject("TASK-1", "review", "sam", Some("needs tests".into()))
            .await
            .unwrap();
        assert!(!keeper.can_advance("TASK-1", "review").await.unwrap());

        keeper.approve("TASK-1", "review", "sam", None).await.unwrap();
        assert!(keeper.can_advance("TASK-1", "review").await.unwrap());
    }

    #[tokio::test]
    async fn ungated_phase_cannot_advance() {
        let (keeper, _) = keeper().await;
        assert!(!keeper.can_advance("TASK-1", "implement").await.unwrap());
    }
}
