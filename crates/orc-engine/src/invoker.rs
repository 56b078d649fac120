//! The seam to the external LLM agent process.
//!
//! The engine only ever talks to `AgentInvoker`; production wires the
//! subprocess implementation, tests script a mock. The agent contract is
//! line-oriented: the process receives the rendered prompt on stdin, emits
//! transcript JSON lines on stdout, and may end with a single report object
//! carrying structured results (gate verdict, constitution verdict,
//! proposals, token counts).

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use orc_core::types::{KnowledgeKind, TokenUsage, Transcript, TranscriptKind};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub task_id: String,
    pub phase: String,
    pub iteration: u32,
    pub prompt: String,
    pub model: Option<String>,
    /// Where the agent works; the task's worktree.
    pub workdir: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    pub approved: bool,
    #[serde(default)]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstitutionVerdict {
    pub passed: bool,
    #[serde(default)]
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedSubtask {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedKnowledge {
    pub kind: KnowledgeKind,
    pub name: String,
    pub description: String,
}

/// Everything one agent invocation produced.
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub success: bool,
    pub response: String,
    pub transcripts: Vec<Transcript>,
    pub tokens: TokenUsage,
    pub gate: Option<GateVerdict>,
    pub constitution: Option<ConstitutionVerdict>,
    pub proposed_subtasks: Vec<ProposedSubtask>,
    pub proposed_knowledge: Vec<ProposedKnowledge>,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

/// Structured trailer the agent may print as its last stdout line.
#[derive(Debug, Clone, Default, Deserialize)]
struct AgentReport {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    gate: Option<GateVerdict>,
    #[serde(default)]
    constitution: Option<ConstitutionVerdict>,
    #[serde(default)]
    subtasks: Vec<ProposedSubtask>,
    #[serde(default)]
    knowledge: Vec<ProposedKnowledge>,
    #[serde(default)]
    tokens: Option<TokenUsage>,
    #[serde(default)]
    cost_usd: Option<f64>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// Transient: the runner retries with backoff.
    #[error("agent timed out after {0:?}")]
    Timeout(Duration),
    /// Transient: spawn or IO problems.
    #[error("agent process error: {0}")]
    Process(String),
    /// The agent ran and reported failure.
    #[error("agent reported failure: {0}")]
    Failed(String),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutcome, InvokeError>;
}

// ---------------------------------------------------------------------------
// Subprocess implementation
// ---------------------------------------------------------------------------

/// Runs the configured agent binary in the task worktree.
pub struct SubprocessInvoker {
    command: String,
    args: Vec<String>,
}

impl SubprocessInvoker {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

#[async_trait::async_trait]
impl AgentInvoker for SubprocessInvoker {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutcome, InvokeError> {
        let start = std::time::Instant::now();

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .current_dir(&request.workdir)
            .env("ORC_TASK_ID", &request.task_id)
            .env("ORC_PHASE", &request.phase)
            .env("ORC_ITERATION", request.iteration.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(model) = &request.model {
            cmd.env("ORC_MODEL", model);
        }

        let mut child = cmd.spawn().map_err(|e| InvokeError::Process(e.to_string()))?;

        let mut stdin = child.stdin.take().expect("piped stdin");
        let prompt = request.prompt.clone();
        let write = async move {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await
        };
        write.await.map_err(|e| InvokeError::Process(e.to_string()))?;

        let output = match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(InvokeError::Process(e.to_string())),
            Err(_) => return Err(InvokeError::Timeout(request.timeout)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut outcome = parse_agent_stdout(&stdout, request);
        outcome.duration_ms = start.elapsed().as_millis() as u64;

        if !output.status.success() && !outcome.success {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InvokeError::Failed(format!(
                "exit {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(outcome)
    }
}

/// Interpret agent stdout: transcript JSON lines, free text, and an optional
/// trailing report object.
fn parse_agent_stdout(stdout: &str, request: &AgentRequest) -> AgentOutcome {
    let mut outcome = AgentOutcome {
        success: true,
        ..AgentOutcome::default()
    };
    let mut plain_lines: Vec<&str> = Vec::new();

    for line in stdout.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(mut transcript) = serde_json::from_str::<Transcript>(trimmed) {
            transcript.task_id = request.task_id.clone();
            transcript.phase = request.phase.clone();
            outcome.transcripts.push(transcript);
            continue;
        }
        plain_lines.push(trimmed);
    }

    // The last non-transcript line may be the structured report.
    if let Some(last) = plain_lines.last() {
        if let Ok(report) = serde_json::from_str::<AgentReport>(last) {
            plain_lines.pop();
            if let Some(success) = report.success {
                outcome.success = success;
            }
            outcome.gate = report.gate;
            outcome.constitution = report.constitution;
            outcome.proposed_subtasks = report.subtasks;
            outcome.proposed_knowledge = report.knowledge;
            if let Some(tokens) = report.tokens {
                outcome.tokens = tokens;
            }
            outcome.cost_usd = report.cost_usd.unwrap_or(0.0);
        }
    }
    outcome.response = plain_lines.join("\n");

    // Without an explicit token report, sum the assistant transcripts.
    if outcome.tokens == TokenUsage::default() {
        for t in &outcome.transcripts {
            if t.kind == TranscriptKind::Assistant {
                outcome.tokens.input += t.tokens.input;
                outcome.tokens.output += t.tokens.output;
                outcome.tokens.cache_creation += t.tokens.cache_creation;
                outcome.tokens.cache_read += t.tokens.cache_read;
            }
        }
    }
    outcome
}

// ---------------------------------------------------------------------------
// Mock implementation
// ---------------------------------------------------------------------------

/// Scripted invoker for tests: pops one result per call and records every
/// request it saw.
pub struct MockInvoker {
    script: std::sync::Mutex<std::collections::VecDeque<Result<AgentOutcome, InvokeError>>>,
    requests: std::sync::Mutex<Vec<AgentRequest>>,
}

impl MockInvoker {
    pub fn new(script: Vec<Result<AgentOutcome, InvokeError>>) -> Self {
        Self {
            script: std::sync::Mutex::new(script.into()),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// An invoker that always succeeds with the given response.
    pub fn always_ok(response: &str) -> Self {
        let outcome = AgentOutcome {
            success: true,
            response: response.to_string(),
            ..AgentOutcome::default()
        };
        Self {
            script: std::sync::Mutex::new(
                std::iter::repeat_with(move || Ok(outcome.clone()))
                    .take(64)
                    .collect(),
            ),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn seen_requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().expect("mock lock").clone()
    }
}

#[async_trait::async_trait]
impl AgentInvoker for MockInvoker {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutcome, InvokeError> {
        self.requests.lock().expect("mock lock").push(request.clone());
        self.script
            .lock()
            .expect("mock lock")
            .pop_front()
            .unwrap_or_else(|| Err(InvokeError::Process("mock script exhausted".into())))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
