//! Agents, phase templates, and the phase-agent associations the planner
//! reads. Associations are returned ordered by `(sequence, agent_id)` so the
//! engine can group them into parallel batches.

use orc_core::types::{AgentDef, PhaseAgent, PhaseTemplate, TaskWeight};

use crate::{DbResultExt, ProjectDb, Result, StoreError};

#[derive(Clone)]
pub struct PhaseAgentStore {
    db: ProjectDb,
}

impl PhaseAgentStore {
    pub fn new(db: ProjectDb) -> Self {
        Self { db }
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    pub async fn upsert_agent(&self, agent: &AgentDef) -> Result<()> {
        let a = agent.clone();
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agents (id, name, description, prompt, tools, model, is_builtin)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        description = excluded.description,
                        prompt = excluded.prompt,
                        tools = excluded.tools,
                        model = excluded.model,
                        is_builtin = excluded.is_builtin",
                    rusqlite::params![
                        a.id,
                        a.name,
                        a.description,
                        a.prompt,
                        serde_json::to_string(&a.tools).expect("serialize tools"),
                        a.model,
                        a.is_builtin,
                    ],
                )?;
                Ok(())
            })
            .await
            .op("upsert agent")
    }

    pub async fn get_agent(&self, id: &str) -> Result<Option<AgentDef>> {
        let id = id.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, description, prompt, tools, model, is_builtin
                     FROM agents WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_agent(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .op("get agent")
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentDef>> {
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, description, prompt, tools, model, is_builtin
                     FROM agents ORDER BY name",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_agent(row)?);
                }
                Ok(out)
            })
            .await
            .op("list agents")
    }

    /// Delete a non-builtin agent. Deleting a missing agent is not an error.
    pub async fn delete_agent(&self, id: &str) -> Result<()> {
        if let Some(existing) = self.get_agent(id).await? {
            if existing.is_builtin {
                return Err(StoreError::Builtin("agent"));
            }
        }
        let id = id.to_string();
        self.db
            .connection()
            .call(move |conn| {
                conn.execute("DELETE FROM agents WHERE id = ?1", rusqlite::params![id])?;
                Ok(())
            })
            .await
            .op("delete agent")
    }

    // -----------------------------------------------------------------------
    // Phase templates
    // -----------------------------------------------------------------------

    pub async fn upsert_phase_template(&self, template: &PhaseTemplate) -> Result<()> {
        let t = template.clone();
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO phase_templates (id, name, prompt_source, prompt_path)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        prompt_source = excluded.prompt_source,
                        prompt_path = excluded.prompt_path",
                    rusqlite::params![t.id, t.name, t.prompt_source, t.prompt_path],
                )?;
                Ok(())
            })
            .await
            .op("upsert phase template")
    }

    pub async fn get_phase_template(&self, id: &str) -> Result<Option<PhaseTemplate>> {
        let id = id.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, prompt_source, prompt_path FROM phase_templates WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(PhaseTemplate {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        prompt_source: row.get(2)?,
                        prompt_path: row.get(3)?,
                    })),
                    None => Ok(None),
                }
            })
            .await
            .op("get phase template")
    }

    // -----------------------------------------------------------------------
    // Phase-agent associations
    // -----------------------------------------------------------------------

    pub async fn add_phase_agent(&self, assoc: &PhaseAgent) -> Result<()> {
        let a = assoc.clone();
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO phase_agents
                        (id, phase_template_id, agent_id, sequence, role, weight_filter, is_builtin)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                        phase_template_id = excluded.phase_template_id,
                        agent_id = excluded.agent_id,
                        sequence = excluded.sequence,
                        role = excluded.role,
                        weight_filter = excluded.weight_filter,
                        is_builtin = excluded.is_builtin",
                    rusqlite::params![
                        a.id,
                        a.phase_template_id,
                        a.agent_id,
                        a.sequence,
                        a.role,
                        serde_json::to_string(&a.weight_filter).expect("serialize weight filter"),
                        a.is_builtin,
                    ],
                )?;
                Ok(())
            })
            .await
            .op("add phase agent")
    }

    /// Builtin associations refuse deletion.
    pub async fn delete_phase_agent(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        let deleted_builtin = self
            .db
            .connection()
            .call(move |conn| {
                let builtin: Option<bool> = conn
                    .query_row(
                        "SELECT is_builtin FROM phase_agents WHERE id = ?1",
                        rusqlite::params![&id],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                match builtin {
                    Some(true) => Ok(true),
                    Some(false) => {
                        conn.execute(
                            "DELETE FROM phase_agents WHERE id = ?1",
                            rusqlite::params![&id],
                        )?;
                        Ok(false)
                    }
                    None => Ok(false), // deleting a missing row is fine
                }
            })
            .await
            .op("delete phase agent")?;
        if deleted_builtin {
            return Err(StoreError::Builtin("phase agent"));
        }
        Ok(())
    }

    /// Associations for a template that apply to the given weight. An empty
    /// stored filter matches every weight.
    pub async fn phase_agents_for_weight(
        &self,
        phase_template_id: &str,
        weight: TaskWeight,
    ) -> Result<Vec<PhaseAgent>> {
        let all = self.list_phase_agents(phase_template_id).await?;
        Ok(all.into_iter().filter(|a| a.applies_to(weight)).collect())
    }

    /// Weight-filtered associations joined to their agent definitions.
    /// Associations whose agent has been deleted are silently skipped.
    pub async fn phase_agents_with_definitions(
        &self,
        phase_template_id: &str,
        weight: TaskWeight,
    ) -> Result<Vec<(PhaseAgent, AgentDef)>> {
        let assocs = self.phase_agents_for_weight(phase_template_id, weight).await?;
        let mut out = Vec::with_capacity(assocs.len());
        for assoc in assocs {
            match self.get_agent(&assoc.agent_id).await? {
                Some(agent) => out.push((assoc, agent)),
                None => {
                    tracing::debug!(
                        phase_agent = %assoc.id,
                        agent = %assoc.agent_id,
                        "skipping association with deleted agent"
                    );
                }
            }
        }
        Ok(out)
    }

    async fn list_phase_agents(&self, phase_template_id: &str) -> Result<Vec<PhaseAgent>> {
        let template = phase_template_id.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, phase_template_id, agent_id, sequence, role, weight_filter, is_builtin
                     FROM phase_agents WHERE phase_template_id = ?1
                     ORDER BY sequence, agent_id",
                )?;
                let mut rows = stmt.query(rusqlite::params![template])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let filter_raw: Option<String> = row.get(5)?;
                    out.push(PhaseAgent {
                        id: row.get(0)?,
                        phase_template_id: row.get(1)?,
                        agent_id: row.get(2)?,
                        sequence: row.get(3)?,
                        role: row.get(4)?,
                        weight_filter: filter_raw
                            .and_then(|raw| serde_json::from_str(&raw).ok())
                            .unwrap_or_default(),
                        is_builtin: row.get(6)?,
                    });
                }
                Ok(out)
            })
            .await
            .op("list phase agents")
    }
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentDef> {
    let tools_raw: String = row.get(4)?;
    Ok(AgentDef {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        prompt: row.get(3)?,
        tools: serde_json::from_str(&tools_raw).unwrap_or_default(),
        model: row.get(5)?,
        is_builtin: row.get(6)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> PhaseAgentStore {
        PhaseAgentStore::new(ProjectDb::open_in_memory().await.unwrap())
    }

    fn agent(id: &str) -> AgentDef {
        AgentDef {
            id: id.into(),
            name: format!("agent {id}"),
            description: "test agent".into(),
            prompt: "do the work".into(),
            tools: vec!["bash".into(), "edit".into()],
            model: Some("claude-sonnet-4".into()),
            is_builtin: false,
        }
    }

    fn assoc(id: &str, agent_id: &str, sequence: i32, filter: Vec<TaskWeight>) -> PhaseAgent {
        PhaseAgent {
            id: id.into(),
            phase_template_id: "pt-implement".into(),
            agent_id: agent_id.into(),
            sequence,
            role: None,
            weight_filter: filter,
            is_builtin: false,
        }
    }

    #[tokio::test]
    async fn weight_filter_selects_associations() {
        let store = store().await;
        store
            .add_phase_agent(&assoc("pa-1", "a-1", 1, vec![]))
            .await
            .unwrap();
        store
            .add_phase_agent(&assoc("pa-2", "a-2", 1, vec![TaskWeight::Large]))
            .await
            .unwrap();

        let small = store
            .phase_agents_for_weight("pt-implement", TaskWeight::Small)
            .await
            .unwrap();
        assert_eq!(small.len(), 1);
        assert_eq!(small[0].id, "pa-1");

        let large = store
            .phase_agents_for_weight("pt-implement", TaskWeight::Large)
            .await
            .unwrap();
        assert_eq!(large.len(), 2);
    }

    #[tokio::test]
    async fn associations_ordered_by_sequence_then_agent() {
        let store = store().await;
        store
            .add_phase_agent(&assoc("pa-3", "a-z", 2, vec![]))
            .await
            .unwrap();
        store
            .add_phase_agent(&assoc("pa-1", "a-b", 1, vec![]))
            .await
            .unwrap();
        store
            .add_phase_agent(&assoc("pa-2", "a-a", 1, vec![]))
            .await
            .unwrap();

        let ordered = store
            .phase_agents_for_weight("pt-implement", TaskWeight::Medium)
            .await
            .unwrap();
        let ids: Vec<&str> = ordered.iter().map(|a| a.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["a-a", "a-b", "a-z"]);
    }

    #[tokio::test]
    async fn definitions_join_skips_deleted_agents() {
        let store = store().await;
        store.upsert_agent(&agent("a-1")).await.unwrap();
        store
            .add_phase_agent(&assoc("pa-1", "a-1", 1, vec![]))
            .await
            .unwrap();
        // pa-2 points at an agent that was never created.
        store
            .add_phase_agent(&assoc("pa-2", "a-ghost", 1, vec![]))
            .await
            .unwrap();

        let joined = store
            .phase_agents_with_definitions("pt-implement", TaskWeight::Medium)
            .await
            .unwrap();
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].1.id, "a-1");
    }

    #[tokio::test]
    async fn builtin_association_refuses_delete() {
        let store = store().await;
        let mut builtin = assoc("pa-b", "a-1", 1, vec![]);
        builtin.is_builtin = true;
        store.add_phase_agent(&builtin).await.unwrap();

        let err = store.delete_phase_agent("pa-b").await;
        assert!(matches!(err, Err(StoreError::Builtin(_))));

        // Deleting a missing association is not an error.
        store.delete_phase_agent("pa-missing").await.unwrap();
    }

    #[tokio::test]
    async fn builtin_agent_refuses_delete() {
        let store = store().await;
        let mut a = agent("a-b");
        a.is_builtin = true;
        store.upsert_agent(&a).await.unwrap();

        let err = store.delete_agent("a-b").await;
        assert!(matches!(err, Err(StoreError::Builtin(_))));
    }

    #[tokio::test]
    async fn phase_template_roundtrip() {
        let store = store().await;
        let t = PhaseTemplate {
            id: "pt-implement".into(),
            name: "implement".into(),
            prompt_source: "embedded".into(),
            prompt_path: None,
        };
        store.upsert_phase_template(&t).await.unwrap();
        let back = store.get_phase_template("pt-implement").await.unwrap().unwrap();
        assert_eq!(back.name, "implement");
    }
}
