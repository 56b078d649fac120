//! Cost telemetry over the global database: immutable per-entry records,
//! per-model and time-bucketed rollups, daily aggregates, and monthly
//! budgets with alert thresholds.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DbResultExt, GlobalDb, Result};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One immutable cost record for an agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEntry {
    pub project_id: String,
    pub task_id: String,
    pub phase: String,
    pub model: String,
    pub iteration: Option<u32>,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub total_tokens: u64,
    pub initiative_id: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Daily rollup row, unique per `(project, model, phase, date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostAggregate {
    pub project_id: String,
    pub model: String,
    pub phase: String,
    /// `YYYY-MM-DD`.
    pub date: String,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostBudget {
    pub project_id: String,
    pub monthly_limit_usd: f64,
    pub alert_threshold_percent: f64,
    /// `YYYY-MM`.
    pub current_month: String,
    pub current_month_spent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub monthly_limit: f64,
    pub spent: f64,
    pub percent_used: f64,
    pub at_alert_threshold: bool,
    pub over_budget: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Day,
    Week,
    Month,
}

/// Per-model slice of one time bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCost {
    pub model: String,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One ordered bucket of the cost time series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostBucket {
    pub bucket: String,
    pub models: Vec<ModelCost>,
    pub total_cost: f64,
}

// ---------------------------------------------------------------------------
// Model family detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    Opus,
    Sonnet,
    Haiku,
    Unknown,
}

/// Map a free-form model identifier to its family by case-insensitive
/// substring.
pub fn detect_model_family(model: &str) -> ModelFamily {
    let lower = model.to_lowercase();
    if lower.contains("opus") {
        ModelFamily::Opus
    } else if lower.contains("sonnet") {
        ModelFamily::Sonnet
    } else if lower.contains("haiku") {
        ModelFamily::Haiku
    } else {
        ModelFamily::Unknown
    }
}

// ---------------------------------------------------------------------------
// CostStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CostStore {
    db: GlobalDb,
}

impl CostStore {
    pub fn new(db: GlobalDb) -> Self {
        Self { db }
    }

    /// Append a full cost record.
    pub async fn record_cost_extended(&self, entry: &CostEntry) -> Result<()> {
        let e = entry.clone();
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO cost_log
                        (project_id, task_id, phase, model, iteration, cost_usd,
                         input_tokens, output_tokens, cache_creation_tokens,
                         cache_read_tokens, total_tokens, initiative_id, duration_ms, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    rusqlite::params![
                        e.project_id,
                        e.task_id,
                        e.phase,
                        e.model,
                        e.iteration,
                        e.cost_usd,
                        e.input_tokens as i64,
                        e.output_tokens as i64,
                        e.cache_creation_tokens as i64,
                        e.cache_read_tokens as i64,
                        e.total_tokens as i64,
                        crate::empty_to_null(e.initiative_id.clone()),
                        e.duration_ms as i64,
                        e.timestamp.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
            .op("record cost")
    }

    /// Pre-model-column entrypoint, kept for callers that never learned
    /// about models. Records with an empty model.
    pub async fn record_cost(
        &self,
        project_id: &str,
        task_id: &str,
        phase: &str,
        cost_usd: f64,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<()> {
        self.record_cost_extended(&CostEntry {
            project_id: project_id.into(),
            task_id: task_id.into(),
            phase: phase.into(),
            model: String::new(),
            iteration: None,
            cost_usd,
            input_tokens,
            output_tokens,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            total_tokens: input_tokens + output_tokens,
            initiative_id: None,
            duration_ms: 0,
            timestamp: Utc::now(),
        })
        .await
    }

    /// Cost per model since the cutoff. An empty `project_id` spans all
    /// projects.
    pub async fn get_cost_by_model(
        &self,
        project_id: &str,
        since: DateTime<Utc>,
    ) -> Result<BTreeMap<String, f64>> {
        let project = project_id.to_string();
        let since_ms = since.timestamp_millis();
        self.db
            .connection()
            .call(move |conn| {
                let sql = if project.is_empty() {
                    "SELECT model, SUM(cost_usd) FROM cost_log
                     WHERE timestamp >= ?1 GROUP BY model"
                } else {
                    "SELECT model, SUM(cost_usd) FROM cost_log
                     WHERE timestamp >= ?1 AND project_id = ?2 GROUP BY model"
                };
                let mut stmt = conn.prepare(sql)?;
                let mut rows = if project.is_empty() {
                    stmt.query(rusqlite::params![since_ms])?
                } else {
                    stmt.query(rusqlite::params![since_ms, project])?
                };
                let mut out = BTreeMap::new();
                while let Some(row) = rows.next()? {
                    out.insert(row.get::<_, String>(0)?, row.get::<_, f64>(1)?);
                }
                Ok(out)
            })
            .await
            .op("get cost by model")
    }

    /// Ordered time series of cost buckets, grouped by model inside each
    /// bucket.
    pub async fn get_cost_timeseries(
        &self,
        project_id: &str,
        since: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<CostBucket>> {
        let project = project_id.to_string();
        let since_ms = since.timestamp_millis();
        let bucket_expr = match granularity {
            Granularity::Day => "strftime('%Y-%m-%d', timestamp / 1000, 'unixepoch')",
            Granularity::Week => "strftime('%Y-W%W', timestamp / 1000, 'unixepoch')",
            Granularity::Month => "strftime('%Y-%m', timestamp / 1000, 'unixepoch')",
        };
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {bucket_expr} AS bucket, model, SUM(cost_usd),
                            SUM(input_tokens), SUM(output_tokens)
                     FROM cost_log
                     WHERE timestamp >= ?1 AND project_id = ?2
                     GROUP BY bucket, model ORDER BY bucket, model"
                ))?;
                let mut rows = stmt.query(rusqlite::params![since_ms, project])?;

                let mut buckets: Vec<CostBucket> = Vec::new();
                while let Some(row) = rows.next()? {
                    let bucket: String = row.get(0)?;
                    let model_cost = ModelCost {
                        model: row.get(1)?,
                        cost_usd: row.get(2)?,
                        input_tokens: row.get::<_, i64>(3)? as u64,
                        output_tokens: row.get::<_, i64>(4)? as u64,
                    };
                    match buckets.last_mut() {
                        Some(last) if last.bucket == bucket => {
                            last.total_cost += model_cost.cost_usd;
                            last.models.push(model_cost);
                        }
                        _ => buckets.push(CostBucket {
                            bucket,
                            total_cost: model_cost.cost_usd,
                            models: vec![model_cost],
                        }),
                    }
                }
                Ok(buckets)
            })
            .await
            .op("get cost timeseries")
    }

    // -----------------------------------------------------------------------
    // Aggregates
    // -----------------------------------------------------------------------

    /// Upsert a daily rollup keyed by `(project, model, phase, date)`.
    pub async fn update_cost_aggregate(&self, agg: &CostAggregate) -> Result<()> {
        let a = agg.clone();
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO cost_aggregates
                        (project_id, model, phase, date, cost_usd, input_tokens,
                         output_tokens, cache_creation_tokens, cache_read_tokens, total_tokens)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(project_id, model, phase, date) DO UPDATE SET
                        cost_usd = excluded.cost_usd,
                        input_tokens = excluded.input_tokens,
                        output_tokens = excluded.output_tokens,
                        cache_creation_tokens = excluded.cache_creation_tokens,
                        cache_read_tokens = excluded.cache_read_tokens,
                        total_tokens = excluded.total_tokens",
                    rusqlite::params![
                        a.project_id,
                        a.model,
                        a.phase,
                        a.date,
                        a.cost_usd,
                        a.input_tokens as i64,
                        a.output_tokens as i64,
                        a.cache_creation_tokens as i64,
                        a.cache_read_tokens as i64,
                        a.total_tokens as i64,
                    ],
                )?;
                Ok(())
            })
            .await
            .op("update cost aggregate")
    }

    /// Aggregates for a project over an inclusive `YYYY-MM-DD` date range.
    pub async fn get_cost_aggregates(
        &self,
        project_id: &str,
        from_date: &str,
        to_date: &str,
    ) -> Result<Vec<CostAggregate>> {
        let project = project_id.to_string();
        let from_date = from_date.to_string();
        let to_date = to_date.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT project_id, model, phase, date, cost_usd, input_tokens,
                            output_tokens, cache_creation_tokens, cache_read_tokens, total_tokens
                     FROM cost_aggregates
                     WHERE project_id = ?1 AND date >= ?2 AND date <= ?3
                     ORDER BY date, model, phase",
                )?;
                let mut rows = stmt.query(rusqlite::params![project, from_date, to_date])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(CostAggregate {
                        project_id: row.get(0)?,
                        model: row.get(1)?,
                        phase: row.get(2)?,
                        date: row.get(3)?,
                        cost_usd: row.get(4)?,
                        input_tokens: row.get::<_, i64>(5)? as u64,
                        output_tokens: row.get::<_, i64>(6)? as u64,
                        cache_creation_tokens: row.get::<_, i64>(7)? as u64,
                        cache_read_tokens: row.get::<_, i64>(8)? as u64,
                        total_tokens: row.get::<_, i64>(9)? as u64,
                    });
                }
                Ok(out)
            })
            .await
            .op("get cost aggregates")
    }

    // -----------------------------------------------------------------------
    // Budgets
    // -----------------------------------------------------------------------

    pub async fn set_budget(&self, budget: &CostBudget) -> Result<()> {
        let b = budget.clone();
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO cost_budgets
                        (project_id, monthly_limit_usd, alert_threshold_percent,
                         current_month, current_month_spent)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(project_id) DO UPDATE SET
                        monthly_limit_usd = excluded.monthly_limit_usd,
                        alert_threshold_percent = excluded.alert_threshold_percent,
                        current_month = excluded.current_month,
                        current_month_spent = excluded.current_month_spent",
                    rusqlite::params![
                        b.project_id,
                        b.monthly_limit_usd,
                        b.alert_threshold_percent,
                        b.current_month,
                        b.current_month_spent,
                    ],
                )?;
                Ok(())
            })
            .await
            .op("set budget")
    }

    /// Absence of a budget is not an error.
    pub async fn get_budget(&self, project_id: &str) -> Result<Option<CostBudget>> {
        let project = project_id.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT project_id, monthly_limit_usd, alert_threshold_percent,
                            current_month, current_month_spent
                     FROM cost_budgets WHERE project_id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![project])?;
                match rows.next()? {
                    Some(row) => Ok(Some(CostBudget {
                        project_id: row.get(0)?,
                        monthly_limit_usd: row.get(1)?,
                        alert_threshold_percent: row.get(2)?,
                        current_month: row.get(3)?,
                        current_month_spent: row.get(4)?,
                    })),
                    None => Ok(None),
                }
            })
            .await
            .op("get budget")
    }

    /// Budget status for a project; `Ok(None)` when no budget is set.
    pub async fn get_budget_status(&self, project_id: &str) -> Result<Option<BudgetStatus>> {
        let Some(budget) = self.get_budget(project_id).await? else {
            return Ok(None);
        };
        let percent_used = if budget.monthly_limit_usd > 0.0 {
            budget.current_month_spent / budget.monthly_limit_usd * 100.0
        } else {
            0.0
        };
        Ok(Some(BudgetStatus {
            monthly_limit: budget.monthly_limit_usd,
            spent: budget.current_month_spent,
            percent_used,
            at_alert_threshold: percent_used >= budget.alert_threshold_percent,
            over_budget: budget.current_month_spent > budget.monthly_limit_usd,
        }))
    }

    /// Add spend to the project's current month, rolling the month over when
    /// it changed.
    pub async fn add_month_spend(&self, project_id: &str, amount: f64) -> Result<()> {
        let project = project_id.to_string();
        let month = Utc::now().format("%Y-%m").to_string();
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "UPDATE cost_budgets SET
                        current_month_spent = CASE
                            WHEN current_month = ?2 THEN current_month_spent + ?3
                            ELSE ?3
                        END,
                        current_month = ?2
                     WHERE project_id = ?1",
                    rusqlite::params![project, month, amount],
                )?;
                Ok(())
            })
            .await
            .op("add month spend")
    }

    /// Total recorded cost for a project since the cutoff (all models).
    pub async fn total_cost(&self, project_id: &str, since: DateTime<Utc>) -> Result<f64> {
        Ok(self
            .get_cost_by_model(project_id, since)
            .await?
            .values()
            .sum())
    }

    /// Entries for a task, insertion-ordered. Used by per-task cost views.
    pub async fn get_task_costs(&self, project_id: &str, task_id: &str) -> Result<Vec<CostEntry>> {
        let project = project_id.to_string();
        let task = task_id.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT project_id, task_id, phase, model, iteration, cost_usd,
                            input_tokens, output_tokens, cache_creation_tokens,
                            cache_read_tokens, total_tokens, initiative_id, duration_ms, timestamp
                     FROM cost_log WHERE project_id = ?1 AND task_id = ?2 ORDER BY id",
                )?;
                let mut rows = stmt.query(rusqlite::params![project, task])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let ts_ms: i64 = row.get(13)?;
                    out.push(CostEntry {
                        project_id: row.get(0)?,
                        task_id: row.get(1)?,
                        phase: row.get(2)?,
                        model: row.get(3)?,
                        iteration: row.get(4)?,
                        cost_usd: row.get(5)?,
                        input_tokens: row.get::<_, i64>(6)? as u64,
                        output_tokens: row.get::<_, i64>(7)? as u64,
                        cache_creation_tokens: row.get::<_, i64>(8)? as u64,
                        cache_read_tokens: row.get::<_, i64>(9)? as u64,
                        total_tokens: row.get::<_, i64>(10)? as u64,
                        initiative_id: row.get(11)?,
                        duration_ms: row.get::<_, i64>(12)? as u64,
                        timestamp: DateTime::<Utc>::from_timestamp_millis(ts_ms)
                            .unwrap_or_else(Utc::now),
                    });
                }
                Ok(out)
            })
            .await
            .op("get task costs")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> CostStore {
        CostStore::new(GlobalDb::open_in_memory().await.unwrap())
    }

    fn entry(project: &str, model: &str, cost: f64) -> CostEntry {
        CostEntry {
            project_id: project.into(),
            task_id: "TASK-1".into(),
            phase: "implement".into(),
            model: model.into(),
            iteration: Some(1),
            cost_usd: cost,
            input_tokens: 1000,
            output_tokens: 400,
            cache_creation_tokens: 0,
            cache_read_tokens: 100,
            total_tokens: 1500,
            initiative_id: None,
            duration_ms: 1200,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn cost_by_model_sums_per_model() {
        let store = store().await;
        store
            .record_cost_extended(&entry("proj-1", "claude-opus-4", 0.50))
            .await
            .unwrap();
        store
            .record_cost_extended(&entry("proj-1", "claude-sonnet-4", 0.10))
            .await
            .unwrap();
        store
            .record_cost_extended(&entry("proj-2", "claude-sonnet-4", 0.99))
            .await
            .unwrap();

        let since = Utc::now() - chrono::Duration::hours(1);
        let by_model = store.get_cost_by_model("proj-1", since).await.unwrap();
        assert_eq!(by_model.len(), 2);
        assert!((by_model["claude-opus-4"] - 0.50).abs() < 1e-9);
        assert!((by_model["claude-sonnet-4"] - 0.10).abs() < 1e-9);

        // Empty project spans everything.
        let all = store.get_cost_by_model("", since).await.unwrap();
        assert!((all["claude-sonnet-4"] - 1.09).abs() < 1e-9);
    }

    #[tokio::test]
    async fn timeseries_total_matches_recorded() {
        let store = store().await;
        store
            .record_cost_extended(&entry("proj-1", "claude-opus-4", 0.50))
            .await
            .unwrap();
        store
            .record_cost_extended(&entry("proj-1", "claude-sonnet-4", 0.10))
            .await
            .unwrap();

        let since = Utc::now() - chrono::Duration::hours(1);
        let series = store
            .get_cost_timeseries("proj-1", since, Granularity::Day)
            .await
            .unwrap();
        let total: f64 = series.iter().map(|b| b.total_cost).sum();
        assert!((total - 0.60).abs() < 1e-9);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].models.len(), 2);
    }

    #[tokio::test]
    async fn legacy_record_cost_has_empty_model() {
        let store = store().await;
        store
            .record_cost("proj-1", "TASK-1", "spec", 0.05, 100, 50)
            .await
            .unwrap();
        let by_model = store
            .get_cost_by_model("proj-1", Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!((by_model[""] - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn aggregate_upsert_replaces_row() {
        let store = store().await;
        let mut agg = CostAggregate {
            project_id: "proj-1".into(),
            model: "claude-opus-4".into(),
            phase: "implement".into(),
            date: "2026-07-31".into(),
            cost_usd: 1.0,
            input_tokens: 10,
            output_tokens: 5,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            total_tokens: 15,
        };
        store.update_cost_aggregate(&agg).await.unwrap();

        let rows = store
            .get_cost_aggregates("proj-1", "2026-07-01", "2026-07-31")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], agg);

        // Second upsert with updated totals replaces, never duplicates.
        agg.cost_usd = 2.5;
        agg.total_tokens = 40;
        store.update_cost_aggregate(&agg).await.unwrap();
        let rows = store
            .get_cost_aggregates("proj-1", "2026-07-01", "2026-07-31")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].cost_usd - 2.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn budget_status_thresholds() {
        let store = store().await;
        assert!(store.get_budget("proj-1").await.unwrap().is_none());
        assert!(store.get_budget_status("proj-1").await.unwrap().is_none());

        store
            .set_budget(&CostBudget {
                project_id: "proj-1".into(),
                monthly_limit_usd: 100.0,
                alert_threshold_percent: 80.0,
                current_month: "2026-08".into(),
                current_month_spent: 85.0,
            })
            .await
            .unwrap();

        let status = store.get_budget_status("proj-1").await.unwrap().unwrap();
        assert!((status.percent_used - 85.0).abs() < 1e-9);
        assert!(status.at_alert_threshold);
        assert!(!status.over_budget);

        store
            .set_budget(&CostBudget {
                project_id: "proj-1".into(),
                monthly_limit_usd: 100.0,
                alert_threshold_percent: 80.0,
                current_month: "2026-08".into(),
                current_month_spent: 120.0,
            })
            .await
            .unwrap();
        let status = store.get_budget_status("proj-1").await.unwrap().unwrap();
        assert!(status.over_budget);
    }

    #[tokio::test]
    async fn task_costs_keep_insertion_order() {
        let store = store().await;
        for cost in [0.1, 0.2, 0.3] {
            store
                .record_cost_extended(&entry("proj-1", "claude-sonnet-4", cost))
                .await
                .unwrap();
        }
        let entries = store.get_task_costs("proj-1", "TASK-1").await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!((entries[0].cost_usd - 0.1).abs() < 1e-9);
        assert!((entries[2].cost_usd - 0.3).abs() < 1e-9);
    }

    #[test]
    fn model_family_detection() {
        assert_eq!(detect_model_family("claude-OPUS-4-20250514"), ModelFamily::Opus);
        assert_eq!(detect_model_family("claude-sonnet-4"), ModelFamily::Sonnet);
        assert_eq!(detect_model_family("Claude-Haiku-4"), ModelFamily::Haiku);
        assert_eq!(detect_model_family("gpt-4o"), ModelFamily::Unknown);
        assert_eq!(detect_model_family(""), ModelFamily::Unknown);
    }
}
