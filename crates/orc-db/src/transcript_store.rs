//! Transcript ingestion and retrieval: batched inserts, cursor pagination,
//! full-text search, token aggregation, todo snapshots, and cleanup.

use chrono::Utc;
use orc_core::types::{TodoItem, TodoSnapshot, TokenUsage, Transcript, TranscriptKind};
use rusqlite::types::Value;

use crate::sql_util::{enum_from_sql, enum_to_sql, ts_from_sql, ts_to_sql};
use crate::{DbResultExt, ProjectDb, Result, SearchDialect};

const DEFAULT_PAGE_LIMIT: u32 = 50;
const MAX_PAGE_LIMIT: u32 = 200;
const SEARCH_LIMIT: u32 = 50;
const SNIPPET_TOKENS: u32 = 32;

const TRANSCRIPT_COLUMNS: &str = "id, task_id, phase, session_id, workflow_run_id, message_uuid,
     parent_uuid, kind, role, content, model, input_tokens, output_tokens,
     cache_creation_tokens, cache_read_tokens, tool_calls, tool_results, timestamp";

// ---------------------------------------------------------------------------
// Pagination types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default)]
pub struct PageOpts {
    pub phase: Option<String>,
    pub cursor: Option<i64>,
    pub limit: Option<u32>,
    pub direction: PageDirection,
}

#[derive(Debug, Clone)]
pub struct TranscriptPage {
    pub transcripts: Vec<Transcript>,
    /// Count over the base predicate, excluding the cursor.
    pub total_count: u64,
    pub has_more: bool,
    pub next_cursor: Option<i64>,
    pub prev_cursor: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub task_id: String,
    pub phase: String,
    pub session_id: String,
    pub snippet: String,
    pub rank: f64,
}

// ---------------------------------------------------------------------------
// TranscriptStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TranscriptStore {
    db: ProjectDb,
}

impl TranscriptStore {
    pub fn new(db: ProjectDb) -> Self {
        Self { db }
    }

    pub async fn add(&self, transcript: Transcript) -> Result<i64> {
        let ids = self.add_batch(vec![transcript]).await?;
        Ok(ids[0])
    }

    /// Insert a batch through a single multi-row statement inside one
    /// transaction. Row ids come back contiguous: the first assigned id is
    /// `last_insert_rowid() - n + 1`.
    pub async fn add_batch(&self, transcripts: Vec<Transcript>) -> Result<Vec<i64>> {
        if transcripts.is_empty() {
            return Ok(Vec::new());
        }
        let n = transcripts.len() as i64;
        self.db
            .run_in_tx("add transcript batch", move |tx| {
                let placeholders = vec!["(?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)"; transcripts.len()]
                    .join(", ");
                let sql = format!(
                    "INSERT INTO transcripts
                        (task_id, phase, session_id, workflow_run_id, message_uuid,
                         parent_uuid, kind, role, content, model, input_tokens,
                         output_tokens, cache_creation_tokens, cache_read_tokens,
                         tool_calls, tool_results, timestamp)
                     VALUES {placeholders}"
                );

                let mut values: Vec<Value> = Vec::with_capacity(transcripts.len() * 17);
                for t in &transcripts {
                    values.push(t.task_id.clone().into());
                    values.push(t.phase.clone().into());
                    values.push(t.session_id.clone().into());
                    values.push(crate::empty_to_null(t.workflow_run_id.clone()).into());
                    values.push(t.message_uuid.clone().into());
                    values.push(t.parent_uuid.clone().into());
                    values.push(enum_to_sql(&t.kind).into());
                    values.push(t.role.clone().into());
                    values.push(t.content.clone().into());
                    values.push(t.model.clone().into());
                    values.push((t.tokens.input as i64).into());
                    values.push((t.tokens.output as i64).into());
                    values.push((t.tokens.cache_creation as i64).into());
                    values.push((t.tokens.cache_read as i64).into());
                    values.push(t.tool_calls.clone().into());
                    values.push(t.tool_results.clone().into());
                    values.push(t.timestamp_ms.into());
                }

                tx.execute(&sql, rusqlite::params_from_iter(values))?;
                let last = tx.last_insert_rowid();
                let first = last - n + 1;
                Ok((first..=last).collect())
            })
            .await
    }

    /// All transcripts for a task in insertion order (`timestamp`, then id).
    pub async fn get_transcripts(&self, task: &str) -> Result<Vec<Transcript>> {
        let task = task.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TRANSCRIPT_COLUMNS} FROM transcripts
                     WHERE task_id = ?1 ORDER BY timestamp, id"
                ))?;
                let mut rows = stmt.query(rusqlite::params![task])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_transcript(row)?);
                }
                Ok(out)
            })
            .await
            .op("get transcripts")
    }

    /// Cursor-paginated retrieval. Fetches `limit + 1` rows to learn whether
    /// more exist, then trims to `limit`.
    pub async fn get_transcripts_paginated(
        &self,
        task: &str,
        opts: PageOpts,
    ) -> Result<TranscriptPage> {
        let task = task.to_string();
        let limit = opts
            .limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .min(MAX_PAGE_LIMIT) as usize;

        self.db
            .connection()
            .call(move |conn| {
                let mut base_where = String::from("task_id = ?1");
                let mut base_params: Vec<Value> = vec![task.clone().into()];
                if let Some(phase) = &opts.phase {
                    base_where.push_str(" AND phase = ?2");
                    base_params.push(phase.clone().into());
                }

                // total_count uses the base predicate only, never the cursor.
                let total_count: u64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM transcripts WHERE {base_where}"),
                    rusqlite::params_from_iter(base_params.clone()),
                    |row| row.get(0),
                )?;

                let mut where_clause = base_where.clone();
                let mut params = base_params;
                if let Some(cursor) = opts.cursor {
                    let cmp = match opts.direction {
                        PageDirection::Asc => ">",
                        PageDirection::Desc => "<",
                    };
                    where_clause.push_str(&format!(" AND id {cmp} ?{}", params.len() + 1));
                    params.push(cursor.into());
                }
                let order = match opts.direction {
                    PageDirection::Asc => "ASC",
                    PageDirection::Desc => "DESC",
                };

                let mut stmt = conn.prepare(&format!(
                    "SELECT {TRANSCRIPT_COLUMNS} FROM transcripts
                     WHERE {where_clause} ORDER BY id {order} LIMIT {}",
                    limit + 1
                ))?;
                let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
                let mut transcripts = Vec::new();
                while let Some(row) = rows.next()? {
                    transcripts.push(row_to_transcript(row)?);
                }

                let has_more = transcripts.len() > limit;
                transcripts.truncate(limit);

                let next_cursor = if has_more {
                    transcripts.last().map(|t| t.id)
                } else {
                    None
                };
                // "Previous" under desc mirrors asc: the first id of the page
                // whenever the caller supplied a cursor.
                let prev_cursor = if opts.cursor.is_some() {
                    transcripts.first().map(|t| t.id)
                } else {
                    None
                };

                Ok(TranscriptPage {
                    transcripts,
                    total_count,
                    has_more,
                    next_cursor,
                    prev_cursor,
                })
            })
            .await
            .op("get transcripts paginated")
    }

    /// Full-text search over transcript content. Up to 50 hits ordered by
    /// rank, snippets wrapped in `<mark>` tags. Under the `Like` dialect the
    /// search degrades to a substring scan with synthesized snippets.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        match self.db.dialect() {
            SearchDialect::Fts5 => self.search_fts(query).await,
            SearchDialect::Like => self.search_like(query).await,
        }
    }

    async fn search_fts(&self, query: &str) -> Result<Vec<SearchHit>> {
        let match_expr = fts_quote(query);
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT t.task_id, t.phase, t.session_id,
                            snippet(transcripts_fts, 0, '<mark>', '</mark>', '…', {SNIPPET_TOKENS}),
                            rank
                     FROM transcripts_fts
                     JOIN transcripts t ON t.id = transcripts_fts.rowid
                     WHERE transcripts_fts MATCH ?1
                     ORDER BY rank LIMIT {SEARCH_LIMIT}"
                ))?;
                let mut rows = stmt.query(rusqlite::params![match_expr])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(SearchHit {
                        task_id: row.get(0)?,
                        phase: row.get(1)?,
                        session_id: row.get(2)?,
                        snippet: row.get(3)?,
                        rank: row.get(4)?,
                    });
                }
                Ok(out)
            })
            .await
            .op("search transcripts")
    }

    async fn search_like(&self, query: &str) -> Result<Vec<SearchHit>> {
        let needle = query.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT task_id, phase, session_id, content FROM transcripts
                     WHERE content LIKE '%' || ?1 || '%'
                     ORDER BY id DESC LIMIT {SEARCH_LIMIT}"
                ))?;
                let mut rows = stmt.query(rusqlite::params![needle])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let content: String = row.get(3)?;
                    out.push(SearchHit {
                        task_id: row.get(0)?,
                        phase: row.get(1)?,
                        session_id: row.get(2)?,
                        snippet: like_snippet(&content, &needle),
                        rank: 0.0,
                    });
                }
                Ok(out)
            })
            .await
            .op("search transcripts")
    }

    /// Sum assistant-message tokens for a task.
    pub async fn token_totals(&self, task: &str) -> Result<TokenUsage> {
        let task = task.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let usage = conn.query_row(
                    "SELECT COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                            COALESCE(SUM(cache_creation_tokens), 0), COALESCE(SUM(cache_read_tokens), 0)
                     FROM transcripts WHERE task_id = ?1 AND kind = 'assistant'",
                    rusqlite::params![task],
                    |row| {
                        Ok(TokenUsage {
                            input: row.get::<_, i64>(0)? as u64,
                            output: row.get::<_, i64>(1)? as u64,
                            cache_creation: row.get::<_, i64>(2)? as u64,
                            cache_read: row.get::<_, i64>(3)? as u64,
                        })
                    },
                )?;
                Ok(usage)
            })
            .await
            .op("token totals")
    }

    /// Assistant-token sums per phase for a task.
    pub async fn token_totals_by_phase(&self, task: &str) -> Result<Vec<(String, TokenUsage)>> {
        let task = task.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT phase, COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                            COALESCE(SUM(cache_creation_tokens), 0), COALESCE(SUM(cache_read_tokens), 0)
                     FROM transcripts WHERE task_id = ?1 AND kind = 'assistant'
                     GROUP BY phase ORDER BY phase",
                )?;
                let mut rows = stmt.query(rusqlite::params![task])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((
                        row.get(0)?,
                        TokenUsage {
                            input: row.get::<_, i64>(1)? as u64,
                            output: row.get::<_, i64>(2)? as u64,
                            cache_creation: row.get::<_, i64>(3)? as u64,
                            cache_read: row.get::<_, i64>(4)? as u64,
                        },
                    ));
                }
                Ok(out)
            })
            .await
            .op("token totals by phase")
    }

    // -----------------------------------------------------------------------
    // Todo snapshots
    // -----------------------------------------------------------------------

    pub async fn add_todo_snapshot(
        &self,
        task: &str,
        phase: &str,
        message_uuid: Option<String>,
        items: Vec<TodoItem>,
    ) -> Result<i64> {
        let task = task.to_string();
        let phase = phase.to_string();
        let items_json = serde_json::to_string(&items).expect("serialize todo items");
        let now = ts_to_sql(&Utc::now());
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO todo_snapshots (task_id, phase, message_uuid, items, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![task, phase, message_uuid, items_json, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .op("add todo snapshot")
    }

    pub async fn latest_todo_snapshot(&self, task: &str) -> Result<Option<TodoSnapshot>> {
        let task = task.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, task_id, phase, message_uuid, items, timestamp
                     FROM todo_snapshots WHERE task_id = ?1 ORDER BY id DESC LIMIT 1",
                )?;
                let mut rows = stmt.query(rusqlite::params![task])?;
                match rows.next()? {
                    Some(row) => {
                        let items_raw: String = row.get(4)?;
                        Ok(Some(TodoSnapshot {
                            id: row.get(0)?,
                            task_id: row.get(1)?,
                            phase: row.get(2)?,
                            message_uuid: row.get(3)?,
                            items: serde_json::from_str(&items_raw).unwrap_or_default(),
                            timestamp: ts_from_sql(&row.get::<_, String>(5)?),
                        }))
                    }
                    None => Ok(None),
                }
            })
            .await
            .op("latest todo snapshot")
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    /// Purge transcripts older than the cutoff. Returns the number removed.
    pub async fn delete_older_than(&self, age: chrono::Duration) -> Result<usize> {
        let cutoff_ms = (Utc::now() - age).timestamp_millis();
        self.db
            .connection()
            .call(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM transcripts WHERE timestamp < ?1",
                    rusqlite::params![cutoff_ms],
                )?)
            })
            .await
            .op("delete old transcripts")
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Quote a free-form query for FTS5 MATCH. Double quotes inside the query
/// are escaped by doubling.
fn fts_quote(query: &str) -> String {
    format!("\"{}\"", query.replace('"', "\"\""))
}

/// Build a `<mark>`-wrapped snippet for the LIKE fallback: a window of text
/// around the first case-insensitive occurrence.
fn like_snippet(content: &str, needle: &str) -> String {
    let lower_content = content.to_lowercase();
    let lower_needle = needle.to_lowercase();
    let Some(pos) = lower_content.find(&lower_needle) else {
        return content.chars().take(160).collect();
    };
    let start = content[..pos]
        .char_indices()
        .rev()
        .nth(60)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let end = (pos + needle.len() + 60).min(content.len());
    // Clamp to char boundaries.
    let start = floor_char_boundary(content, start);
    let end = floor_char_boundary(content, end);

    let mut snippet = String::new();
    if start > 0 {
        snippet.push('…');
    }
    snippet.push_str(&content[start..pos]);
    snippet.push_str("<mark>");
    snippet.push_str(&content[pos..pos + needle.len()]);
    snippet.push_str("</mark>");
    snippet.push_str(&content[pos + needle.len()..end]);
    if end < content.len() {
        snippet.push('…');
    }
    snippet
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn row_to_transcript(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transcript> {
    let kind: String = row.get(7)?;
    Ok(Transcript {
        id: row.get(0)?,
        task_id: row.get(1)?,
        phase: row.get(2)?,
        session_id: row.get(3)?,
        workflow_run_id: row.get(4)?,
        message_uuid: row.get(5)?,
        parent_uuid: row.get(6)?,
        kind: enum_from_sql::<TranscriptKind>(&kind),
        role: row.get(8)?,
        content: row.get(9)?,
        model: row.get(10)?,
        tokens: TokenUsage {
            input: row.get::<_, i64>(11)? as u64,
            output: row.get::<_, i64>(12)? as u64,
            cache_creation: row.get::<_, i64>(13)? as u64,
            cache_read: row.get::<_, i64>(14)? as u64,
        },
        tool_calls: row.get(15)?,
        tool_results: row.get(16)?,
        timestamp_ms: row.get(17)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
