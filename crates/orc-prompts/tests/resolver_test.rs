//! Inheritance-chain resolution across prompt sources.

use orc_prompts::{PromptError, PromptResolver, PromptSource};

struct Dirs {
    _tmp: tempfile::TempDir,
    personal: std::path::PathBuf,
    local: std::path::PathBuf,
    project: std::path::PathBuf,
}

fn dirs() -> Dirs {
    let tmp = tempfile::tempdir().unwrap();
    let personal = tmp.path().join("personal");
    let local = tmp.path().join("local");
    let project = tmp.path().join("project");
    for d in [&personal, &local, &project] {
        std::fs::create_dir_all(d).unwrap();
    }
    Dirs {
        _tmp: tmp,
        personal,
        local,
        project,
    }
}

fn resolver(d: &Dirs) -> PromptResolver {
    PromptResolver::new()
        .with_personal_dir(&d.personal)
        .with_local_dir(&d.local)
        .with_project_dir(&d.project)
}

#[test]
fn project_file_beats_embedded() {
    let d = dirs();
    std::fs::write(d.project.join("implement.md"), "project implement prompt\n").unwrap();

    let resolved = resolver(&d).resolve("implement").unwrap();
    assert_eq!(resolved.source, PromptSource::Project);
    assert_eq!(resolved.content, "project implement prompt\n");
}

#[test]
fn personal_file_beats_everything() {
    let d = dirs();
    std::fs::write(d.personal.join("implement.md"), "personal\n").unwrap();
    std::fs::write(d.local.join("implement.md"), "local\n").unwrap();
    std::fs::write(d.project.join("implement.md"), "project\n").unwrap();

    let resolved = resolver(&d).resolve("implement").unwrap();
    assert_eq!(resolved.source, PromptSource::Personal);
    assert_eq!(resolved.content, "personal\n");
}

#[test]
fn two_level_inheritance_chain() {
    let d = dirs();
    std::fs::write(
        d.local.join("implement.md"),
        "---\nextends: project\nprepend: |\n  LOCAL PREPEND\n---\n",
    )
    .unwrap();
    std::fs::write(
        d.project.join("implement.md"),
        "---\nextends: embedded\nprepend: |\n  PROJECT PREPEND\n---\n",
    )
    .unwrap();

    let resolved = resolver(&d).resolve("implement").unwrap();
    assert_eq!(resolved.source, PromptSource::Local);
    assert_eq!(
        resolved.inherited_from,
        vec![PromptSource::Project, PromptSource::Embedded]
    );
    assert!(resolved.content.starts_with("LOCAL PREPEND\n"));
    assert!(resolved.content.contains("PROJECT PREPEND"));
    // The embedded implement prompt body makes it through the whole chain.
    assert!(resolved.content.contains("isolated worktree"));
}

#[test]
fn append_lands_after_parent() {
    let d = dirs();
    std::fs::write(
        d.project.join("review.md"),
        "---\nextends: embedded\nappend: |\n  EXTRA RULE\n---\n",
    )
    .unwrap();

    let resolved = resolver(&d).resolve("review").unwrap();
    assert!(resolved.content.ends_with("EXTRA RULE"));
    assert!(resolved.content.contains("Review the diff"));
}

#[test]
fn circular_extends_fails_with_cycle_error() {
    let d = dirs();
    std::fs::write(d.local.join("x.md"), "---\nextends: project\n---\n").unwrap();
    std::fs::write(d.project.join("x.md"), "---\nextends: local\n---\n").unwrap();

    let err = resolver(&d).resolve("x").unwrap_err();
    assert!(matches!(err, PromptError::Cycle(_)));
    assert!(err.to_string().contains("cycle"), "got: {err}");
}

#[test]
fn extends_missing_parent_errors() {
    let d = dirs();
    std::fs::write(d.local.join("y.md"), "---\nextends: project\n---\nbody\n").unwrap();

    let err = resolver(&d).resolve("y").unwrap_err();
    assert!(matches!(err, PromptError::ParentNotFound { .. }));
}

#[test]
fn extends_unconfigured_source_errors() {
    let d = dirs();
    std::fs::write(d.project.join("z.md"), "---\nextends: personal\n---\n").unwrap();

    let bare = PromptResolver::new().with_project_dir(&d.project);
    let err = bare.resolve("z").unwrap_err();
    assert!(matches!(err, PromptError::SourceNotConfigured(_)));
}
