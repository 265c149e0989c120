use serde::{Deserialize, Serialize};

/// A directed edge between two nodes in the workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    /// Source node id.
    pub source: String,
    /// Target node id.
    pub target: String,
    /// Option label that must be chosen at a decision source. `None` means unconditional.
    #[serde(default)]
    pub condition: Option<String>,
}

impl Edge {
    /// Create an unconditional edge.
    pub fn always(source: impl Into<String>, target: impl Into<String>) -> Self {
        let (source, target) = (source.into(), target.into());
        Self {
            id: format!("{}->{}", source, target),
            source,
            target,
            condition: None,
        }
    }

    /// Create an edge taken when `option` is chosen at the source decision node.
    pub fn on_choice(
        source: impl Into<String>,
        target: impl Into<String>,
        option: impl Into<String>,
    ) -> Self {
        let (source, target, option) = (source.into(), target.into(), option.into());
        Self {
            id: format!("{}->{}[{}]", source, target, option),
            source,
            target,
            condition: Some(option),
        }
    }

    /// Override the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn is_unconditional(&self) -> bool {
        self.condition.is_none()
    }

    /// Whether this edge is the one selected by `option`.
    pub fn matches(&self, option: &str) -> bool {
        self.condition.as_deref() == Some(option)
    }
}
