use chrono::{DateTime, Utc};
use orc_core::types::TokenUsage;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    State,
    Transcript,
    Tokens,
    Phase,
    Complete,
    Finalize,
    Gate,
}

// ---------------------------------------------------------------------------
// OrcEvent
// ---------------------------------------------------------------------------

/// One event on the wire: `{project, task_id, event, data, ts}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrcEvent {
    pub project: String,
    pub task_id: String,
    pub event: EventKind,
    pub data: serde_json::Value,
    pub ts: DateTime<Utc>,
}

impl OrcEvent {
    pub fn new(
        project: impl Into<String>,
        task_id: impl Into<String>,
        event: EventKind,
        data: serde_json::Value,
    ) -> Self {
        Self {
            project: project.into(),
            task_id: task_id.into(),
            event,
            data,
            ts: Utc::now(),
        }
    }

    /// Task status change.
    pub fn state(project: impl Into<String>, task_id: impl Into<String>, status: &str) -> Self {
        Self::new(
            project,
            task_id,
            EventKind::State,
            serde_json::json!({ "status": status }),
        )
    }

    /// Partial streaming transcript content.
    pub fn transcript_chunk(
        project: impl Into<String>,
        task_id: impl Into<String>,
        chunk: &TranscriptChunk,
    ) -> Self {
        let mut data = serde_json::to_value(chunk).expect("serialize chunk");
        data["subtype"] = "chunk".into();
        Self::new(project, task_id, EventKind::Transcript, data)
    }

    /// A transcript message completed; consumers should reload.
    pub fn transcript_response(
        project: impl Into<String>,
        task_id: impl Into<String>,
        phase: &str,
    ) -> Self {
        Self::new(
            project,
            task_id,
            EventKind::Transcript,
            serde_json::json!({ "subtype": "response", "phase": phase }),
        )
    }

    /// Incremental token counts; consumers accumulate.
    pub fn tokens(
        project: impl Into<String>,
        task_id: impl Into<String>,
        delta: &TokensDelta,
    ) -> Self {
        Self::new(
            project,
            task_id,
            EventKind::Tokens,
            serde_json::to_value(delta).expect("serialize tokens"),
        )
    }

    pub fn phase(
        project: impl Into<String>,
        task_id: impl Into<String>,
        phase: &str,
        status: &str,
    ) -> Self {
        Self::new(
            project,
            task_id,
            EventKind::Phase,
            serde_json::json!({ "phase": phase, "status": status }),
        )
    }

    pub fn complete(
        project: impl Into<String>,
        task_id: impl Into<String>,
        success: bool,
        detail: serde_json::Value,
    ) -> Self {
        Self::new(
            project,
            task_id,
            EventKind::Complete,
            serde_json::json!({ "success": success, "detail": detail }),
        )
    }

    pub fn gate(
        project: impl Into<String>,
        task_id: impl Into<String>,
        phase: &str,
        approved: bool,
    ) -> Self {
        Self::new(
            project,
            task_id,
            EventKind::Gate,
            serde_json::json!({ "phase": phase, "approved": approved }),
        )
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptChunk {
    pub phase: String,
    pub iteration: u32,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokensDelta {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    pub total_tokens: u64,
}

impl From<TokenUsage> for TokensDelta {
    fn from(usage: TokenUsage) -> Self {
        Self {
            input_tokens: usage.input,
            output_tokens: usage.output,
            cache_read_input_tokens: (usage.cache_read > 0).then_some(usage.cache_read),
            total_tokens: usage.total(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_wire_names() {
        assert_eq!(serde_json::to_string(&EventKind::Finalize).unwrap(), "\"finalize\"");
        assert_eq!(serde_json::to_string(&EventKind::State).unwrap(), "\"state\"");
    }

    #[test]
    fn transcript_chunk_carries_subtype() {
        let ev = OrcEvent::transcript_chunk(
            "proj-1",
            "TASK-1",
            &TranscriptChunk {
                phase: "implement".into(),
                iteration: 2,
                content: "writing tests".into(),
            },
        );
        assert_eq!(ev.event, EventKind::Transcript);
        assert_eq!(ev.data["subtype"], "chunk");
        assert_eq!(ev.data["iteration"], 2);
    }

    #[test]
    fn tokens_delta_from_usage() {
        let delta: TokensDelta = TokenUsage {
            input: 10,
            output: 5,
            cache_creation: 1,
            cache_read: 0,
        }
        .into();
        assert_eq!(delta.total_tokens, 16);
        assert_eq!(delta.cache_read_input_tokens, None);
    }

    #[test]
    fn event_roundtrips_as_json() {
        let ev = OrcEvent::state("proj-1", "TASK-1", "running");
        let json = serde_json::to_string(&ev).unwrap();
        let back: OrcEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.project, "proj-1");
        assert_eq!(back.event, EventKind::State);
        assert_eq!(back.data["status"], "running");
    }
}
