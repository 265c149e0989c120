use thiserror::Error;

/// Structural problems found in a workflow graph before a run starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Edge '{edge_id}' references unknown node '{node_id}'")]
    DanglingEdge { edge_id: String, node_id: String },

    #[error("Graph has no Start node")]
    MissingStart,

    #[error("Graph has more than one Start node: {node_ids:?}")]
    MultipleStarts { node_ids: Vec<String> },

    #[error("Start node '{node_id}' has incoming edge '{edge_id}'")]
    StartHasIncoming { node_id: String, edge_id: String },

    #[error("Node '{node_id}' is not reachable from Start")]
    UnreachableNode { node_id: String },

    #[error("Decision node '{node_id}' options do not match its outgoing edges: {reason}")]
    DecisionOptionMismatch { node_id: String, reason: String },

    #[error("Unconditional edges form a cycle through node '{node_id}'")]
    CycleDetected { node_id: String },

    #[error("Duplicate node id: {node_id}")]
    DuplicateNodeId { node_id: String },

    #[error("Node '{node_id}' must have exactly {expected} unconditional outgoing edge(s), found {found}")]
    InvalidOutDegree {
        node_id: String,
        expected: usize,
        found: usize,
    },

    #[error("Agent node '{node_id}' has no agent id")]
    MissingAgentId { node_id: String },
}

/// Rejections from the decision gate. A rejected resume leaves the run untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecisionError {
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Run {run_id} is not waiting on a decision at node '{node_id}'")]
    RunNotWaiting { run_id: String, node_id: String },

    #[error("Unknown option '{option}' (expected one of {expected:?})")]
    UnknownOption {
        option: String,
        expected: Vec<String>,
    },
}

/// Failure signalled by an agent invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    /// Timeouts, rate limits, detectable malformed output. Retried.
    #[error("transient: {0}")]
    Transient(String),

    /// Bad configuration or credentials. Never retried.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl AgentError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// The human-readable reason without the classification prefix.
    pub fn reason(&self) -> &str {
        match self {
            Self::Transient(r) | Self::Permanent(r) => r,
        }
    }
}

#[derive(Debug, Error)]
pub enum FlowError {
    // Graph errors
    #[error("Graph validation failed: {0}")]
    Validation(#[from] ValidationError),

    // Run errors
    #[error("Decision rejected: {0}")]
    Decision(#[from] DecisionError),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent invocation failed: {0}")]
    Agent(#[from] AgentError),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_error_classification() {
        assert!(AgentError::Transient("rate limited".into()).is_transient());
        assert!(!AgentError::Permanent("no api key".into()).is_transient());
        assert_eq!(AgentError::Permanent("no api key".into()).reason(), "no api key");
    }

    #[test]
    fn validation_error_wraps_into_flow_error() {
        let err: FlowError = ValidationError::MissingStart.into();
        assert!(matches!(err, FlowError::Validation(ValidationError::MissingStart)));
        assert_eq!(err.to_string(), "Graph validation failed: Graph has no Start node");
    }
}
