//! The initiative dependency DAG: `blocked_by` validation, cycle detection,
//! and the computed inverse (`blocks`).
//!
//! Everything here works on adjacency maps built from flat slices; the graph
//! never holds references between initiative values, and cycles are checked
//! on mutation rather than traversal.

use std::collections::{HashMap, HashSet};

use crate::types::{BlockerInfo, Initiative, InitiativeStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
#[error("dependency error on {initiative_id}: {message}")]
pub struct DependencyError {
    pub initiative_id: String,
    pub message: String,
}

impl DependencyError {
    fn new(id: &str, message: impl Into<String>) -> Self {
        Self {
            initiative_id: id.to_string(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a proposed `blocked_by` list: no self-reference, no unknown
/// initiative. Returns every violation, not just the first.
pub fn validate_blocked_by(
    id: &str,
    blockers: &[String],
    existing_ids: &HashSet<String>,
) -> Vec<String> {
    let mut errors = Vec::new();
    for blocker in blockers {
        if blocker == id {
            errors.push("initiative cannot block itself".to_string());
        } else if !existing_ids.contains(blocker) {
            errors.push(format!("blocked_by references non-existent initiative {blocker}"));
        }
    }
    errors
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

/// Would adding `new_blocker` to `id` close a cycle? Returns the cycle path
/// ordered from `id` around and back, or `None`.
pub fn detect_circular_dependency(
    id: &str,
    new_blocker: &str,
    initiatives: &[Initiative],
) -> Option<Vec<String>> {
    detect_circular_dependency_with_all(id, &[new_blocker.to_string()], initiatives)
}

/// Cycle check for a whole proposed `blocked_by` replacement.
pub fn detect_circular_dependency_with_all(
    id: &str,
    new_blockers: &[String],
    initiatives: &[Initiative],
) -> Option<Vec<String>> {
    // Adjacency map id -> blocked_by, with the proposed change applied on top.
    let mut adjacency: HashMap<&str, Vec<&str>> = initiatives
        .iter()
        .map(|i| (i.id.as_str(), i.blocked_by.iter().map(String::as_str).collect()))
        .collect();
    let entry = adjacency.entry(id).or_default();
    for blocker in new_blockers {
        if !entry.contains(&blocker.as_str()) {
            entry.push(blocker);
        }
    }

    // DFS from `id` along blocked_by edges; finding `id` again is a cycle.
    let mut path: Vec<&str> = vec![id];
    let mut visited: HashSet<&str> = HashSet::new();
    if dfs_find_cycle(id, id, &adjacency, &mut visited, &mut path) {
        // Discovery order already runs id -> ... -> id; hand it back rooted
        // at the initiative under edit.
        return Some(path.into_iter().map(str::to_string).collect());
    }
    None
}

fn dfs_find_cycle<'a>(
    start: &str,
    current: &'a str,
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> bool {
    let Some(neighbors) = adjacency.get(current) else {
        return false;
    };
    for next in neighbors {
        if *next == start {
            path.push(next);
            return true;
        }
        if visited.insert(next) {
            path.push(next);
            if dfs_find_cycle(start, next, adjacency, visited, path) {
                return true;
            }
            path.pop();
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Computed fields
// ---------------------------------------------------------------------------

/// Initiatives whose `blocked_by` contains `id`, sorted.
pub fn compute_blocks(id: &str, all: &[Initiative]) -> Vec<String> {
    let mut blocks: Vec<String> = all
        .iter()
        .filter(|i| i.blocked_by.iter().any(|b| b == id))
        .map(|i| i.id.clone())
        .collect();
    blocks.sort();
    blocks
}

/// Assign `.blocks` on every initiative from the full set. `blocks` is
/// derived state and never persisted.
pub fn populate_computed_fields(all: &mut [Initiative]) {
    let snapshot: Vec<Initiative> = all.to_vec();
    for initiative in all.iter_mut() {
        initiative.blocks = compute_blocks(&initiative.id, &snapshot);
    }
}

// ---------------------------------------------------------------------------
// Mutation helpers
// ---------------------------------------------------------------------------

impl Initiative {
    /// Validate, de-duplicate, cycle-check, then append and sort.
    pub fn add_blocker(&mut self, blocker_id: &str, all: &[Initiative]) -> Result<(), DependencyError> {
        let existing: HashSet<String> = all.iter().map(|i| i.id.clone()).collect();
        let proposed = vec![blocker_id.to_string()];
        let errors = validate_blocked_by(&self.id, &proposed, &existing);
        if let Some(first) = errors.into_iter().next() {
            return Err(DependencyError::new(&self.id, first));
        }
        if self.blocked_by.iter().any(|b| b == blocker_id) {
            return Ok(()); // already present
        }
        if let Some(cycle) = detect_circular_dependency(&self.id, blocker_id, all) {
            return Err(DependencyError::new(
                &self.id,
                format!("adding {blocker_id} creates a cycle: {}", cycle.join(" -> ")),
            ));
        }
        self.blocked_by.push(blocker_id.to_string());
        self.blocked_by.sort();
        Ok(())
    }

    /// Remove in place; removing an absent blocker is a no-op.
    pub fn remove_blocker(&mut self, blocker_id: &str) {
        self.blocked_by.retain(|b| b != blocker_id);
    }

    /// Replace the whole `blocked_by` list atomically: either every id
    /// validates and the set is acyclic, or nothing changes.
    pub fn set_blocked_by(&mut self, ids: Vec<String>, all: &[Initiative]) -> Result<(), DependencyError> {
        let existing: HashSet<String> = all.iter().map(|i| i.id.clone()).collect();
        let errors = validate_blocked_by(&self.id, &ids, &existing);
        if let Some(first) = errors.into_iter().next() {
            return Err(DependencyError::new(&self.id, first));
        }
        let mut deduped: Vec<String> = Vec::new();
        for id in ids {
            if !deduped.contains(&id) {
                deduped.push(id);
            }
        }
        if let Some(cycle) = detect_circular_dependency_with_all(&self.id, &deduped, all) {
            return Err(DependencyError::new(
                &self.id,
                format!("blocked_by creates a cycle: {}", cycle.join(" -> ")),
            ));
        }
        deduped.sort();
        self.blocked_by = deduped;
        Ok(())
    }

    /// Blocked iff any `blocked_by` target is missing or not completed.
    pub fn is_blocked(&self, all: &[Initiative]) -> bool {
        self.blocked_by.iter().any(|dep| {
            all.iter()
                .find(|i| &i.id == dep)
                .map_or(true, |i| i.status != InitiativeStatus::Completed)
        })
    }

    /// Ids of blockers that are missing or incomplete.
    pub fn unmet_dependencies(&self, all: &[Initiative]) -> Vec<String> {
        self.blocked_by
            .iter()
            .filter(|dep| {
                all.iter()
                    .find(|i| &&i.id == dep)
                    .map_or(true, |i| i.status != InitiativeStatus::Completed)
            })
            .cloned()
            .collect()
    }

    /// Incomplete blockers with display detail; a missing target shows up as
    /// a synthetic "(initiative not found)" entry.
    pub fn incomplete_blockers(&self, all: &[Initiative]) -> Vec<BlockerInfo> {
        self.blocked_by
            .iter()
            .filter_map(|dep| match all.iter().find(|i| &i.id == dep) {
                Some(found) if found.status == InitiativeStatus::Completed => None,
                Some(found) => Some(BlockerInfo {
                    id: found.id.clone(),
                    title: found.title.clone(),
                    status: format!("{:?}", found.status).to_lowercase(),
                }),
                None => Some(BlockerInfo {
                    id: dep.clone(),
                    title: "(initiative not found)".to_string(),
                    status: "missing".to_string(),
                }),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn init(id: &str, blocked_by: &[&str]) -> Initiative {
        let mut i = Initiative::new(id, format!("title {id}"));
        i.blocked_by = blocked_by.iter().map(|s| s.to_string()).collect();
        i
    }

    #[test]
    fn validate_catches_self_and_unknown() {
        let existing: HashSet<String> =
            ["INIT-001", "INIT-002"].iter().map(|s| s.to_string()).collect();
        let errors = validate_blocked_by(
            "INIT-001",
            &["INIT-001".to_string(), "INIT-404".to_string(), "INIT-002".to_string()],
            &existing,
        );
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("cannot block itself"));
        assert!(errors[1].contains("non-existent initiative INIT-404"));
    }

    #[test]
    fn chain_cycle_is_detected() {
        let all = vec![
            init("INIT-001", &[]),
            init("INIT-002", &["INIT-001"]),
            init("INIT-003", &["INIT-002"]),
        ];
        // 003 -> 002 -> 001; blocking 001 on 003 closes the loop.
        let cycle = detect_circular_dependency("INIT-001", "INIT-003", &all)
            .expect("cycle expected");
        assert!(cycle.contains(&"INIT-001".to_string()));
        assert!(cycle.contains(&"INIT-003".to_string()));
        assert_eq!(cycle.first().map(String::as_str), Some("INIT-001"));
        assert_eq!(cycle.last().map(String::as_str), Some("INIT-001"));
    }

    #[test]
    fn acyclic_addition_passes() {
        let all = vec![
            init("INIT-001", &[]),
            init("INIT-002", &["INIT-001"]),
            init("INIT-003", &[]),
        ];
        assert!(detect_circular_dependency("INIT-003", "INIT-002", &all).is_none());
    }

    #[test]
    fn add_blocker_validates_and_sorts() {
        let all = vec![init("INIT-001", &[]), init("INIT-002", &[]), init("INIT-003", &[])];
        let mut target = init("INIT-009", &[]);

        // Unknown target: the graph only knows 001..003.
        assert!(target.add_blocker("INIT-404", &all).is_err());

        let mut with_target = all.clone();
        with_target.push(target.clone());
        target.add_blocker("INIT-003", &with_target).unwrap();
        target.add_blocker("INIT-001", &with_target).unwrap();
        // Duplicate add is a no-op.
        target.add_blocker("INIT-001", &with_target).unwrap();
        assert_eq!(target.blocked_by, vec!["INIT-001", "INIT-003"]);
    }

    #[test]
    fn set_blocked_by_is_atomic() {
        let all = vec![
            init("INIT-001", &[]),
            init("INIT-002", &["INIT-001"]),
        ];
        let mut target = init("INIT-001", &[]);

        // One bad id poisons the whole replacement.
        let err = target.set_blocked_by(vec!["INIT-002".into(), "INIT-404".into()], &all);
        assert!(err.is_err());
        assert!(target.blocked_by.is_empty());

        // A cyclic set is rejected too (001 <- 002 already).
        let err = target.set_blocked_by(vec!["INIT-002".into()], &all);
        assert!(err.is_err());
        assert!(target.blocked_by.is_empty());
    }

    #[test]
    fn blocks_is_inverse_of_blocked_by() {
        let mut all = vec![
            init("INIT-001", &[]),
            init("INIT-002", &["INIT-001"]),
            init("INIT-003", &["INIT-001", "INIT-002"]),
        ];
        assert_eq!(compute_blocks("INIT-001", &all), vec!["INIT-002", "INIT-003"]);
        assert_eq!(compute_blocks("INIT-003", &all), Vec::<String>::new());

        populate_computed_fields(&mut all);
        assert_eq!(all[0].blocks, vec!["INIT-002", "INIT-003"]);
        assert_eq!(all[1].blocks, vec!["INIT-003"]);
        assert!(all[2].blocks.is_empty());
    }

    #[test]
    fn blocked_status_and_unmet_deps() {
        let mut blocker = init("INIT-001", &[]);
        let target = init("INIT-002", &["INIT-001", "INIT-404"]);

        let all = vec![blocker.clone(), target.clone()];
        assert!(target.is_blocked(&all));
        assert_eq!(target.unmet_dependencies(&all), vec!["INIT-001", "INIT-404"]);

        let infos = target.incomplete_blockers(&all);
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[1].title, "(initiative not found)");

        // Completing the real blocker leaves only the missing one.
        blocker.status = InitiativeStatus::Completed;
        let all = vec![blocker, target.clone()];
        assert!(target.is_blocked(&all));
        assert_eq!(target.unmet_dependencies(&all), vec!["INIT-404"]);
    }
}
