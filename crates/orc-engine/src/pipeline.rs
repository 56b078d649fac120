//! Weight-based phase pipeline selection.
//!
//! The embedded default pipeline is research -> spec -> implement -> review
//! -> finalize; lighter weights drop the front of it.

use orc_core::types::TaskWeight;

pub const PHASE_RESEARCH: &str = "research";
pub const PHASE_SPEC: &str = "spec";
pub const PHASE_IMPLEMENT: &str = "implement";
pub const PHASE_REVIEW: &str = "review";
pub const PHASE_FINALIZE: &str = "finalize";

/// Phase names for a task of the given weight, in execution order.
///
/// Trivial tasks go straight to implementation; small tasks keep the spec
/// but skip research; everything heavier runs the full pipeline.
pub fn phases_for_weight(weight: TaskWeight) -> Vec<&'static str> {
    match weight {
        TaskWeight::Trivial => vec![PHASE_IMPLEMENT, PHASE_REVIEW, PHASE_FINALIZE],
        TaskWeight::Small => vec![PHASE_SPEC, PHASE_IMPLEMENT, PHASE_REVIEW, PHASE_FINALIZE],
        TaskWeight::Medium | TaskWeight::Large | TaskWeight::Greenfield => vec![
            PHASE_RESEARCH,
            PHASE_SPEC,
            PHASE_IMPLEMENT,
            PHASE_REVIEW,
            PHASE_FINALIZE,
        ],
    }
}

/// Phases whose output is validated against the project constitution before
/// the task may leave them.
pub fn is_spec_like(phase: &str) -> bool {
    phase.contains("spec")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trivial_skips_research_and_spec() {
        let phases = phases_for_weight(TaskWeight::Trivial);
        assert_eq!(phases, vec!["implement", "review", "finalize"]);
    }

    #[test]
    fn small_keeps_spec() {
        let phases = phases_for_weight(TaskWeight::Small);
        assert_eq!(phases, vec!["spec", "implement", "review", "finalize"]);
    }

    #[test]
    fn heavier_weights_run_everything() {
        for weight in [TaskWeight::Medium, TaskWeight::Large, TaskWeight::Greenfield] {
            let phases = phases_for_weight(weight);
            assert_eq!(phases.first(), Some(&"research"));
            assert_eq!(phases.last(), Some(&"finalize"));
            assert_eq!(phases.len(), 5);
        }
    }

    #[test]
    fn spec_like_detection() {
        assert!(is_spec_like("spec"));
        assert!(!is_spec_like("implement"));
        assert!(!is_spec_like("research"));
    }
}
