use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AgentError;
use crate::traits::FragmentSink;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-node state within a run: `idle -> waiting -> running -> {completed | error}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Idle,
    Waiting,
    Running,
    Completed,
    Error,
}

/// Overall run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    WaitingOnDecision,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::WaitingOnDecision => "waiting_on_decision",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Streamed output fragments.
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One entry in a run's append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub level: LogLevel,
    pub message: String,
    /// Set on entries that record an agent invocation attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

/// A file produced by an agent before it is attributed to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

impl GeneratedFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// A generated output attached to the run by a completed node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    pub content: String,
    pub produced_by_node_id: String,
}

/// Text output of a completed agent node, kept as context for later nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMessage {
    pub node_id: String,
    pub agent_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// The continuation a suspended run waits on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDecision {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub options: Vec<String>,
}

/// Complete per-run state. A suspended run can be resumed from this alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub graph_id: String,
    pub status: RunStatus,
    pub node_statuses: HashMap<String, NodeStatus>,
    pub log: Vec<LogEntry>,
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub messages: Vec<RunMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_decision: Option<PendingDecision>,
    /// The natural-language request the run was started with.
    #[serde(default)]
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunState {
    /// Fresh state with every node idle.
    pub fn new<I>(run_id: RunId, graph_id: impl Into<String>, node_ids: I, input: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let now = Utc::now();
        Self {
            run_id,
            graph_id: graph_id.into(),
            status: RunStatus::Running,
            node_statuses: node_ids.into_iter().map(|id| (id, NodeStatus::Idle)).collect(),
            log: Vec::new(),
            artifacts: Vec::new(),
            messages: Vec::new(),
            pending_decision: None,
            input: input.into(),
            current_node: None,
            last_error: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Status of a node; unknown ids read as idle.
    pub fn node_status(&self, node_id: &str) -> NodeStatus {
        self.node_statuses.get(node_id).copied().unwrap_or_default()
    }

    /// Log entries recorded for one node, in sequence order.
    pub fn entries_for<'a, 'b>(&'a self, node_id: &'b str) -> impl Iterator<Item = &'a LogEntry> + 'b
    where
        'a: 'b,
    {
        self.log
            .iter()
            .filter(move |e| e.node_id.as_deref() == Some(node_id))
    }

    /// The sequence number the next log entry will receive.
    pub fn next_sequence(&self) -> u64 {
        self.log.last().map(|e| e.sequence + 1).unwrap_or(1)
    }

    pub fn artifact(&self, path: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.path == path)
    }
}

/// Per-node agent configuration. Unset fields fall back to the engine's model defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl AgentConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = Some(streaming);
        self
    }
}

/// Everything an agent sees when invoked.
#[derive(Clone)]
pub struct AgentContext {
    pub run_id: RunId,
    pub node_id: String,
    pub input: String,
    /// Outputs of agent nodes completed earlier in the run.
    pub messages: Vec<RunMessage>,
    /// Artifacts produced so far in the run.
    pub artifacts: Vec<Artifact>,
    /// Corrective instructions appended by the retry coordinator.
    pub corrections: Vec<String>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub fragments: Option<Arc<dyn FragmentSink>>,
}

impl AgentContext {
    pub fn new(run_id: RunId, node_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            input: input.into(),
            messages: Vec::new(),
            artifacts: Vec::new(),
            corrections: Vec::new(),
            attempt: 1,
            fragments: None,
        }
    }

    /// Forward a streamed fragment to whoever is listening.
    pub fn emit_fragment(&self, fragment: &str) {
        if let Some(ref sink) = self.fragments {
            sink.push(fragment);
        }
    }
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("run_id", &self.run_id)
            .field("node_id", &self.node_id)
            .field("input", &self.input)
            .field("messages", &self.messages.len())
            .field("artifacts", &self.artifacts.len())
            .field("corrections", &self.corrections)
            .field("attempt", &self.attempt)
            .field("fragments", &self.fragments.is_some())
            .finish()
    }
}

/// Successful agent output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentOutput {
    pub content: String,
    pub files: Vec<GeneratedFile>,
}

impl AgentOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.push(GeneratedFile::new(path, content));
        self
    }
}

pub type AgentResult = std::result::Result<AgentOutput, AgentError>;

/// Role in a completion request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Request handed to the external text-generation collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub streaming: bool,
}

/// A streaming chunk from the text-generation collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// A fragment of content.
    Delta(String),
    /// A complete generated file.
    File(GeneratedFile),
    /// The response is complete.
    Done,
}

/// Response from the text-generation collaborator.
pub enum Completion {
    Full {
        content: String,
        files: Vec<GeneratedFile>,
    },
    Stream(BoxStream<'static, std::result::Result<StreamChunk, AgentError>>),
}

/// Run event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Run created and traversal started.
    RunStarted { run_id: RunId, graph_id: String },
    /// A node changed status.
    NodeStatusChanged {
        run_id: RunId,
        node_id: String,
        status: NodeStatus,
    },
    /// A log entry was appended.
    LogAppended { run_id: RunId, entry: LogEntry },
    /// A completed node's artifacts became visible.
    ArtifactsMerged {
        run_id: RunId,
        node_id: String,
        paths: Vec<String>,
    },
    /// Run suspended at a decision node.
    DecisionRequested {
        run_id: RunId,
        decision: PendingDecision,
    },
    /// A pending decision was answered.
    DecisionResolved {
        run_id: RunId,
        node_id: String,
        option: String,
    },
    /// Run status changed.
    RunStatusChanged {
        run_id: RunId,
        status: RunStatus,
        last_error: Option<String>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeStatusChanged { run_id, .. }
            | Self::LogAppended { run_id, .. }
            | Self::ArtifactsMerged { run_id, .. }
            | Self::DecisionRequested { run_id, .. }
            | Self::DecisionResolved { run_id, .. }
            | Self::RunStatusChanged { run_id, .. } => run_id,
        }
    }

    /// True for the event that closes a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunStatusChanged { status, .. } if status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::WaitingOnDecision).unwrap();
        assert_eq!(json, "\"waiting_on_decision\"");
        assert_eq!(RunStatus::WaitingOnDecision.to_string(), "waiting_on_decision");
        assert!(!RunStatus::WaitingOnDecision.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn new_run_state_has_idle_nodes() {
        let state = RunState::new(
            RunId::from_string("r1"),
            "g1",
            vec!["start".to_string(), "end".to_string()],
            "build a todo app",
        );
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.node_status("start"), NodeStatus::Idle);
        assert_eq!(state.node_status("missing"), NodeStatus::Idle);
        assert_eq!(state.next_sequence(), 1);
    }

    #[test]
    fn log_entry_skips_empty_fields() {
        let entry = LogEntry {
            sequence: 1,
            timestamp: Utc::now(),
            node_id: None,
            level: LogLevel::Info,
            message: "run started".into(),
            attempt: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("node_id"));
        assert!(!json.contains("attempt"));
        assert!(json.contains("\"level\":\"info\""));
    }

    #[test]
    fn run_state_roundtrips_through_json() {
        let mut state = RunState::new(RunId::new(), "g", vec!["d".to_string()], "x");
        state.status = RunStatus::WaitingOnDecision;
        state.pending_decision = Some(PendingDecision {
            node_id: "d".into(),
            prompt: None,
            options: vec!["approve".into(), "reject".into()],
        });
        let json = serde_json::to_string(&state).unwrap();
        let parsed: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn agent_output_builder() {
        let out = AgentOutput::text("done").with_file("src/main.rs", "fn main() {}");
        assert_eq!(out.files.len(), 1);
        assert_eq!(out.files[0].path, "src/main.rs");
    }
}
