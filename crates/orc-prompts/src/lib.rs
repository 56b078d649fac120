//! orc-prompts -- layered phase prompt resolution.
//!
//! A phase prompt can live in four places, highest priority first: the
//! user's personal overrides (`~/.orc/prompts/`), per-project personal
//! overrides (`~/.orc/projects/<id>/prompts/`), the project's own overrides
//! (`.orc/prompts/`), and the embedded defaults compiled into the binary.
//!
//! A file may start with YAML frontmatter declaring `extends` plus optional
//! `prepend`/`append` blocks; resolution composes the chain with an explicit
//! visited set so a circular `extends` fails instead of recursing forever.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;

mod embedded;

pub use embedded::embedded_prompt;

// ---------------------------------------------------------------------------
// PromptSource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptSource {
    Personal,
    Local,
    Project,
    Embedded,
}

impl PromptSource {
    /// Lower is higher priority in the resolution cascade.
    pub fn priority(&self) -> u8 {
        match self {
            PromptSource::Personal => 0,
            PromptSource::Local => 1,
            PromptSource::Project => 2,
            PromptSource::Embedded => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PromptSource::Personal => "personal",
            PromptSource::Local => "local",
            PromptSource::Project => "project",
            PromptSource::Embedded => "embedded",
        }
    }

    fn from_extends(raw: &str) -> Option<Self> {
        match raw {
            "personal" => Some(PromptSource::Personal),
            "local" => Some(PromptSource::Local),
            "project" => Some(PromptSource::Project),
            "embedded" => Some(PromptSource::Embedded),
            _ => None,
        }
    }
}

impl fmt::Display for PromptSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("prompt not found: {0}")]
    NotFound(String),
    #[error("unknown extends value: {0}")]
    UnknownExtends(String),
    #[error("parent prompt not found: {phase} in {prompt_source}")]
    ParentNotFound { phase: String, prompt_source: PromptSource },
    #[error("prompt source not configured: {0}")]
    SourceNotConfigured(PromptSource),
    #[error("prompt inheritance cycle detected at {0}")]
    Cycle(PromptSource),
    #[error("frontmatter parse error: {0}")]
    Frontmatter(#[from] serde_yaml::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PromptError>;

// ---------------------------------------------------------------------------
// ResolvedPrompt
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ResolvedPrompt {
    pub content: String,
    /// The source whose file won the priority cascade.
    pub source: PromptSource,
    /// Parent sources walked through `extends`, in order.
    pub inherited_from: Vec<PromptSource>,
}

impl ResolvedPrompt {
    /// Expand `{variable}` placeholders.
    pub fn render(&self, vars: &HashMap<String, String>) -> String {
        let mut output = self.content.clone();
        for (key, value) in vars {
            output = output.replace(&format!("{{{}}}", key), value);
        }
        output
    }
}

// ---------------------------------------------------------------------------
// Frontmatter
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct Frontmatter {
    extends: Option<String>,
    prepend: Option<String>,
    append: Option<String>,
}

/// Split leading `---` frontmatter from the body. Returns `(None, text)`
/// when the file has no frontmatter block.
fn split_frontmatter(text: &str) -> Result<(Option<Frontmatter>, String)> {
    let Some(rest) = text.strip_prefix("---\n") else {
        return Ok((None, text.to_string()));
    };
    let Some(end) = rest.find("\n---") else {
        return Ok((None, text.to_string()));
    };
    let yaml = &rest[..end];
    let mut body = &rest[end + 4..];
    if let Some(stripped) = body.strip_prefix('\n') {
        body = stripped;
    }
    let frontmatter: Frontmatter = serde_yaml::from_str(yaml)?;
    Ok((Some(frontmatter), body.to_string()))
}

// ---------------------------------------------------------------------------
// PromptResolver
// ---------------------------------------------------------------------------

/// Resolves a phase name to its final prompt text through the source
/// cascade and `extends` composition.
#[derive(Debug, Clone, Default)]
pub struct PromptResolver {
    personal_dir: Option<PathBuf>,
    local_dir: Option<PathBuf>,
    project_dir: Option<PathBuf>,
    embedded_disabled: bool,
}

impl PromptResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_personal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.personal_dir = Some(dir.into());
        self
    }

    pub fn with_local_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_dir = Some(dir.into());
        self
    }

    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    /// Turn off the embedded fallback (tests use this to verify NotFound).
    pub fn without_embedded(mut self) -> Self {
        self.embedded_disabled = true;
        self
    }

    /// Resolve a phase prompt: first source in priority order whose
    /// `<phase>.md` exists wins, then its inheritance chain is composed.
    pub fn resolve(&self, phase: &str) -> Result<ResolvedPrompt> {
        for source in [
            PromptSource::Personal,
            PromptSource::Local,
            PromptSource::Project,
        ] {
            if let Some(path) = self.source_path(source, phase) {
                if path.exists() {
                    let mut visited = vec![source];
                    let (content, inherited_from) =
                        self.compose(source, phase, &mut visited)?;
                    return Ok(ResolvedPrompt {
                        content,
                        source,
                        inherited_from,
                    });
                }
            }
        }

        if !self.embedded_disabled {
            if let Some(content) = embedded_prompt(phase) {
                return Ok(ResolvedPrompt {
                    content: content.to_string(),
                    source: PromptSource::Embedded,
                    inherited_from: Vec::new(),
                });
            }
        }

        Err(PromptError::NotFound(phase.to_string()))
    }

    /// Load the prompt at `source` and apply its frontmatter, recursing into
    /// the parent chain. `visited` carries the sources already on the chain;
    /// revisiting one is a cycle.
    fn compose(
        &self,
        source: PromptSource,
        phase: &str,
        visited: &mut Vec<PromptSource>,
    ) -> Result<(String, Vec<PromptSource>)> {
        let raw = self.read_source(source, phase)?;
        let (frontmatter, body) = split_frontmatter(&raw)?;

        let Some(frontmatter) = frontmatter else {
            return Ok((body, Vec::new()));
        };
        let Some(extends_raw) = frontmatter.extends.as_deref() else {
            return Ok((body, Vec::new()));
        };

        let parent_source = PromptSource::from_extends(extends_raw)
            .ok_or_else(|| PromptError::UnknownExtends(extends_raw.to_string()))?;
        if visited.contains(&parent_source) {
            return Err(PromptError::Cycle(parent_source));
        }
        visited.push(parent_source);

        let (parent_content, parent_chain) = self.compose(parent_source, phase, visited)?;

        let mut inherited_from = vec![parent_source];
        inherited_from.extend(parent_chain);

        let mut parts: Vec<String> = Vec::new();
        if let Some(prepend) = frontmatter.prepend.as_deref() {
            let trimmed = prepend.trim();
            if !trimmed.is_empty() {
                parts.push(trimmed.to_string());
            }
        }
        parts.push(parent_content);
        if let Some(append) = frontmatter.append.as_deref() {
            let trimmed = append.trim();
            if !trimmed.is_empty() {
                parts.push(trimmed.to_string());
            }
        }

        Ok((parts.join("\n\n"), inherited_from))
    }

    /// Raw text of `<phase>.md` at exactly `source`, no cascade.
    fn read_source(&self, source: PromptSource, phase: &str) -> Result<String> {
        if source == PromptSource::Embedded {
            if self.embedded_disabled {
                return Err(PromptError::SourceNotConfigured(PromptSource::Embedded));
            }
            return embedded_prompt(phase)
                .map(str::to_string)
                .ok_or_else(|| PromptError::ParentNotFound {
                    phase: phase.to_string(),
                    prompt_source: source,
                });
        }

        let path = self
            .source_path(source, phase)
            .ok_or(PromptError::SourceNotConfigured(source))?;
        if !path.exists() {
            return Err(PromptError::ParentNotFound {
                phase: phase.to_string(),
                prompt_source: source,
            });
        }
        Ok(std::fs::read_to_string(path)?)
    }

    fn source_path(&self, source: PromptSource, phase: &str) -> Option<PathBuf> {
        let dir = match source {
            PromptSource::Personal => self.personal_dir.as_ref(),
            PromptSource::Local => self.local_dir.as_ref(),
            PromptSource::Project => self.project_dir.as_ref(),
            PromptSource::Embedded => None,
        }?;
        Some(dir.join(format!("{phase}.md")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order() {
        assert!(PromptSource::Personal.priority() < PromptSource::Local.priority());
        assert!(PromptSource::Local.priority() < PromptSource::Project.priority());
        assert!(PromptSource::Project.priority() < PromptSource::Embedded.priority());
    }

    #[test]
    fn frontmatter_split() {
        let (fm, body) =
            split_frontmatter("---\nextends: embedded\nprepend: |\n  HEAD\n---\nBODY\n").unwrap();
        let fm = fm.unwrap();
        assert_eq!(fm.extends.as_deref(), Some("embedded"));
        assert_eq!(fm.prepend.as_deref(), Some("HEAD\n"));
        assert_eq!(body, "BODY\n");
    }

    #[test]
    fn no_frontmatter_passes_through() {
        let (fm, body) = split_frontmatter("plain prompt text").unwrap();
        assert!(fm.is_none());
        assert_eq!(body, "plain prompt text");
    }

    #[test]
    fn embedded_defaults_exist_for_pipeline_phases() {
        for phase in ["research", "spec", "implement", "review", "finalize"] {
            assert!(embedded_prompt(phase).is_some(), "missing embedded {phase}");
        }
        assert!(embedded_prompt("nonexistent").is_none());
    }

    #[test]
    fn resolve_falls_back_to_embedded() {
        let resolver = PromptResolver::new();
        let resolved = resolver.resolve("implement").unwrap();
        assert_eq!(resolved.source, PromptSource::Embedded);
        assert!(resolved.inherited_from.is_empty());
        assert!(!resolved.content.is_empty());
    }

    #[test]
    fn resolve_unknown_phase_without_embedded_errors() {
        let resolver = PromptResolver::new().without_embedded();
        let err = resolver.resolve("implement");
        assert!(matches!(err, Err(PromptError::NotFound(_))));
    }

    #[test]
    fn render_expands_variables() {
        let resolved = ResolvedPrompt {
            content: "Work on {title} in {phase}".into(),
            source: PromptSource::Embedded,
            inherited_from: vec![],
        };
        let mut vars = HashMap::new();
        vars.insert("title".to_string(), "TASK-1".to_string());
        vars.insert("phase".to_string(), "implement".to_string());
        assert_eq!(resolved.render(&vars), "Work on TASK-1 in implement");
    }

    #[test]
    fn unknown_extends_value_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("implement.md"),
            "---\nextends: galactic\n---\nbody\n",
        )
        .unwrap();
        let resolver = PromptResolver::new().with_project_dir(dir.path());
        let err = resolver.resolve("implement");
        assert!(matches!(err, Err(PromptError::UnknownExtends(v)) if v == "galactic"));
    }
}
