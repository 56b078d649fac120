//! Manifest ingestion: a YAML document that creates (or attaches to) an
//! initiative and batch-creates its tasks with dependencies.

use std::collections::{HashMap, HashSet};

use orc_core::types::{TaskCategory, TaskPriority, TaskWeight};
use serde::Deserialize;

use crate::store::{InitiativeError, InitiativeStore};
use crate::types::Initiative;

// ---------------------------------------------------------------------------
// Document shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub version: u32,
    #[serde(default)]
    pub initiative: Option<String>,
    #[serde(default)]
    pub create_initiative: Option<CreateInitiative>,
    #[serde(default)]
    pub tasks: Vec<ManifestTask>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInitiative {
    pub title: String,
    #[serde(default)]
    pub vision: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestTask {
    /// Local integer id, unique within the manifest.
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub weight: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<i64>,
    #[serde(default)]
    pub spec: Option<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("manifest invalid:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
    #[error("task dependency cycle involving local ids {0:?}")]
    Cycle(Vec<i64>),
    #[error("initiative error: {0}")]
    Initiative(#[from] InitiativeError),
    #[error("task creation failed: {0}")]
    TaskCreation(String),
}

pub type Result<T> = std::result::Result<T, ManifestError>;

// ---------------------------------------------------------------------------
// Parse + validate
// ---------------------------------------------------------------------------

pub fn parse_manifest(yaml: &str) -> Result<Manifest> {
    let manifest: Manifest = serde_yaml::from_str(yaml)?;
    validate_manifest(&manifest)?;
    Ok(manifest)
}

/// Structural validation; every violation is reported.
pub fn validate_manifest(manifest: &Manifest) -> Result<()> {
    let mut errors = Vec::new();

    if manifest.version != 1 {
        errors.push(format!("unsupported manifest version {}", manifest.version));
    }
    match (&manifest.initiative, &manifest.create_initiative) {
        (Some(_), Some(_)) => {
            errors.push("initiative and create_initiative are mutually exclusive".to_string())
        }
        (None, None) => {
            errors.push("one of initiative or create_initiative is required".to_string())
        }
        (Some(id), None) => {
            if let Err(e) = crate::types::validate_id(id) {
                errors.push(e);
            }
        }
        (None, Some(create)) => {
            if create.title.trim().is_empty() {
                errors.push("create_initiative.title must not be empty".to_string());
            }
        }
    }
    if manifest.tasks.is_empty() {
        errors.push("manifest must define at least one task".to_string());
    }

    let mut seen_ids = HashSet::new();
    for task in &manifest.tasks {
        if !seen_ids.insert(task.id) {
            errors.push(format!("duplicate task id {}", task.id));
        }
        if task.title.trim().is_empty() {
            errors.push(format!("task {} has an empty title", task.id));
        }
        if let Some(weight) = &task.weight {
            if weight.parse::<TaskWeight>().is_err() {
                errors.push(format!("task {}: unknown weight {weight}", task.id));
            }
        }
        if let Some(category) = &task.category {
            if category.parse::<TaskCategory>().is_err() {
                errors.push(format!("task {}: unknown category {category}", task.id));
            }
        }
        if let Some(priority) = &task.priority {
            if priority.parse::<TaskPriority>().is_err() {
                errors.push(format!("task {}: unknown priority {priority}", task.id));
            }
        }
        for dep in &task.depends_on {
            if *dep == task.id {
                errors.push(format!("task {} depends on itself", task.id));
            } else if !manifest.tasks.iter().any(|t| t.id == *dep) {
                errors.push(format!("task {}: depends_on references unknown id {dep}", task.id));
            }
        }
    }

    if !errors.is_empty() {
        return Err(ManifestError::Invalid(errors));
    }

    // Cycles are a separate error so callers can report them distinctly.
    topological_sort(&manifest.tasks)?;
    Ok(())
}

/// Kahn's algorithm over local ids: every task appears after all of its
/// dependencies. Ties resolve by ascending local id, so the order is stable.
pub fn topological_sort(tasks: &[ManifestTask]) -> Result<Vec<&ManifestTask>> {
    let by_id: HashMap<i64, &ManifestTask> = tasks.iter().map(|t| (t.id, t)).collect();
    let mut in_degree: HashMap<i64, usize> =
        tasks.iter().map(|t| (t.id, t.depends_on.len())).collect();

    let mut ready: Vec<i64> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    ready.sort_unstable();

    let mut order = Vec::with_capacity(tasks.len());
    while let Some(id) = ready.first().copied() {
        ready.remove(0);
        order.push(by_id[&id]);
        for task in tasks {
            if task.depends_on.contains(&id) {
                let degree = in_degree.get_mut(&task.id).expect("known task");
                *degree -= 1;
                if *degree == 0 {
                    let pos = ready.binary_search(&task.id).unwrap_or_else(|p| p);
                    ready.insert(pos, task.id);
                }
            }
        }
    }

    if order.len() != tasks.len() {
        let stuck: Vec<i64> = in_degree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(id, _)| id)
            .collect();
        return Err(ManifestError::Cycle(stuck));
    }
    Ok(order)
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

/// Seam for creating real tasks from manifest rows; the engine implements it
/// against the task store.
#[async_trait::async_trait]
pub trait TaskCreator: Send + Sync {
    /// Create a task and return its assigned `TASK-<n>` id.
    async fn create_task(
        &self,
        title: &str,
        description: Option<String>,
        weight: TaskWeight,
        category: TaskCategory,
    ) -> std::result::Result<String, String>;
}

/// Outcome of ingesting a manifest.
#[derive(Debug, Clone)]
pub struct IngestResult {
    pub initiative_id: String,
    /// Manifest-local id to created task id, in creation (topological) order.
    pub created: Vec<(i64, String)>,
}

/// Create/attach the initiative and batch-create tasks in dependency order.
pub async fn ingest(
    manifest: &Manifest,
    store: &InitiativeStore,
    creator: &dyn TaskCreator,
) -> Result<IngestResult> {
    validate_manifest(manifest)?;

    let mut initiative: Initiative = match (&manifest.initiative, &manifest.create_initiative) {
        (Some(id), None) => store.load(id).await?,
        (None, Some(create)) => {
            let id = next_initiative_id(store).await?;
            let mut initiative = store.new_initiative(&id, &create.title)?;
            initiative.vision = create.vision.clone();
            initiative
        }
        _ => unreachable!("validated above"),
    };

    let order = topological_sort(&manifest.tasks)?;
    let mut local_to_task: HashMap<i64, String> = HashMap::new();
    let mut created = Vec::with_capacity(order.len());

    for task in order {
        let weight = task
            .weight
            .as_deref()
            .and_then(|w| w.parse().ok())
            .unwrap_or(TaskWeight::Medium);
        let category = task
            .category
            .as_deref()
            .and_then(|c| c.parse().ok())
            .unwrap_or(TaskCategory::Feature);
        let description = match (&task.description, &task.spec) {
            (Some(d), Some(s)) => Some(format!("{d}\n\n{s}")),
            (Some(d), None) => Some(d.clone()),
            (None, Some(s)) => Some(s.clone()),
            (None, None) => None,
        };

        let task_id = creator
            .create_task(&task.title, description, weight, category)
            .await
            .map_err(ManifestError::TaskCreation)?;

        let depends_on: Vec<String> = task
            .depends_on
            .iter()
            .map(|dep| local_to_task[dep].clone())
            .collect();
        initiative.add_task(task_id.clone(), task.title.clone(), depends_on);
        local_to_task.insert(task.id, task_id.clone());
        created.push((task.id, task_id));
    }

    store.save(&mut initiative).await?;
    Ok(IngestResult {
        initiative_id: initiative.id,
        created,
    })
}

/// Next free `INIT-NNN` under the store's base directory.
async fn next_initiative_id(store: &InitiativeStore) -> Result<String> {
    let existing = store.list().await?;
    let mut n = existing.len() as u32 + 1;
    loop {
        let candidate = format!("INIT-{n:03}");
        if !existing.iter().any(|i| i.id == candidate) {
            return Ok(candidate);
        }
        n += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
