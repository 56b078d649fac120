//! Embedded default prompts for the standard phase pipeline. Lowest
//! priority: any file-based override wins.

/// Look up the embedded default for a phase.
pub fn embedded_prompt(phase: &str) -> Option<&'static str> {
    match phase {
        "research" => Some(RESEARCH_PROMPT),
        "spec" => Some(SPEC_PROMPT),
        "implement" => Some(IMPLEMENT_PROMPT),
        "review" => Some(REVIEW_PROMPT),
        "finalize" => Some(FINALIZE_PROMPT),
        _ => None,
    }
}

const RESEARCH_PROMPT: &str = r#"You are the research agent for task {task_id}: {title}.

{description}

Survey the codebase before anything is written:
1. Locate the modules, types, and tests this task will touch.
2. Note existing conventions the change must follow.
3. Identify risks, open questions, and prior art worth reusing.

Write your findings as a concise research note. Do not modify any files.
"#;

const SPEC_PROMPT: &str = r#"You are the spec agent for task {task_id}: {title}.

{description}

Produce an implementation specification:
1. Goal and non-goals, stated precisely.
2. The files and interfaces that change, with before/after sketches.
3. Edge cases and failure modes the implementation must cover.
4. A test plan naming concrete cases.

Respect the project constitution if one exists. Keep the spec short enough
to hold in one review.
"#;

const IMPLEMENT_PROMPT: &str = r#"You are the implementation agent for task {task_id}: {title}.

{description}

You are working in an isolated worktree on branch {branch}. Implement the
task according to the approved spec:
1. Make the change, following the conventions around you.
2. Add or update tests alongside the code.
3. Keep commits focused; do not reformat unrelated code.
4. If you discover necessary follow-up work out of scope, propose it as a
   subtask instead of widening this change.
"#;

const REVIEW_PROMPT: &str = r#"You are the review agent for task {task_id}: {title}.

Review the diff on branch {branch} against the spec:
1. Verify the implementation matches the spec's behavior and edge cases.
2. Check tests actually exercise the change.
3. Flag correctness bugs first, style only where it obscures meaning.

Report pass or fail with concrete findings.
"#;

const FINALIZE_PROMPT: &str = r#"You are the finalize agent for task {task_id}: {title}.

Merge branch {branch} back into {target_branch}:
1. Sync the target branch into the task branch.
2. Resolve conflicts by merging intentions, never by dropping features.
3. Run the full test suite and report results.
4. Assess the risk level of the merge (low, medium, high).
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_carry_task_placeholders() {
        for phase in ["research", "spec", "implement", "review", "finalize"] {
            let prompt = embedded_prompt(phase).unwrap();
            assert!(prompt.contains("{task_id}"), "{phase} lacks task_id");
            assert!(prompt.contains("{title}"), "{phase} lacks title");
        }
    }

    #[test]
    fn finalize_never_removes_features() {
        assert!(FINALIZE_PROMPT.contains("never by dropping features"));
    }
}
