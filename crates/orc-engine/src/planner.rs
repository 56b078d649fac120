//! Grouping phase-agent associations into execution batches.
//!
//! The store hands associations back ordered by `(sequence, agent_id)`;
//! grouping preserves that order, so members of a group run in parallel and
//! groups run serially in ascending sequence.

use orc_core::types::PhaseAgent;

/// Split an ordered association list into sequence groups.
pub fn group_by_sequence(agents: Vec<PhaseAgent>) -> Vec<Vec<PhaseAgent>> {
    let mut groups: Vec<Vec<PhaseAgent>> = Vec::new();
    for agent in agents {
        match groups.last_mut() {
            Some(group) if group[0].sequence == agent.sequence => group.push(agent),
            _ => groups.push(vec![agent]),
        }
    }
    groups
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn assoc(id: &str, agent_id: &str, sequence: i32) -> PhaseAgent {
        PhaseAgent {
            id: id.into(),
            phase_template_id: "pt-implement".into(),
            agent_id: agent_id.into(),
            sequence,
            role: None,
            weight_filter: vec![],
            is_builtin: false,
        }
    }

    #[test]
    fn groups_share_a_sequence() {
        let groups = group_by_sequence(vec![
            assoc("pa-1", "a-a", 1),
            assoc("pa-2", "a-b", 1),
            assoc("pa-3", "a-c", 2),
            assoc("pa-4", "a-d", 3),
            assoc("pa-5", "a-e", 3),
        ]);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].len(), 1);
        assert_eq!(groups[2].len(), 2);
        // Stable order inside a group.
        assert_eq!(groups[0][0].agent_id, "a-a");
        assert_eq!(groups[0][1].agent_id, "a-b");
    }

    #[test]
    fn empty_input_yields_no_groups() {
        assert!(group_by_sequence(vec![]).is_empty());
    }

    #[test]
    fn single_association_is_one_group() {
        let groups = group_by_sequence(vec![assoc("pa-1", "a-a", 5)]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0][0].sequence, 5);
    }
}
