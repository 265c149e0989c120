use serde::{Deserialize, Serialize};

use flowsmith_core::types::AgentConfig;

/// Canvas position, carried for editors; the engine ignores it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// A node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this node.
    pub id: String,
    /// Human-readable label.
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub position: Position,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// What a node does when the scheduler reaches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry point. Exactly one per graph.
    Start,
    /// Invoke a registered agent.
    Agent {
        agent_id: String,
        #[serde(default)]
        config: AgentConfig,
    },
    /// Park the run until a human picks one of `options`.
    HumanDecision {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        options: Vec<String>,
    },
    /// Terminal node.
    End,
}

impl Node {
    fn with_kind(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            position: Position::default(),
            kind,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::with_kind(id, NodeKind::Start)
    }

    pub fn agent(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            NodeKind::Agent {
                agent_id: agent_id.into(),
                config: AgentConfig::default(),
            },
        )
    }

    pub fn decision<I, S>(id: impl Into<String>, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_kind(
            id,
            NodeKind::HumanDecision {
                prompt: None,
                options: options.into_iter().map(Into::into).collect(),
            },
        )
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::with_kind(id, NodeKind::End)
    }

    /// Set the label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn at(mut self, x: f32, y: f32) -> Self {
        self.position = Position { x, y };
        self
    }

    /// Replace the agent configuration. No-op for non-agent nodes.
    pub fn with_config(mut self, new_config: AgentConfig) -> Self {
        if let NodeKind::Agent { ref mut config, .. } = self.kind {
            *config = new_config;
        }
        self
    }

    /// Set the question shown at a decision node. No-op for other nodes.
    pub fn with_prompt(mut self, text: impl Into<String>) -> Self {
        if let NodeKind::HumanDecision { ref mut prompt, .. } = self.kind {
            *prompt = Some(text.into());
        }
        self
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            NodeKind::Start => "start",
            NodeKind::Agent { .. } => "agent",
            NodeKind::HumanDecision { .. } => "human_decision",
            NodeKind::End => "end",
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Agent { agent_id, .. } => Some(agent_id),
            _ => None,
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self.kind, NodeKind::Start)
    }
}
