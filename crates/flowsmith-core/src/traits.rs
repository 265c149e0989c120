use futures::future::BoxFuture;

use crate::error::{AgentError, Result};
use crate::types::*;

/// A named capability the scheduler invokes at agent nodes.
///
/// Built-in and marketplace-installed agents implement the same trait, so
/// adding an agent type is a registry entry, never a scheduler change.
pub trait AgentHandler: Send + Sync + 'static {
    /// Identifier used by graph nodes (e.g. "planner").
    fn id(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Run one attempt with the accumulated run context and the node's configuration.
    fn invoke(&self, context: AgentContext, config: AgentConfig) -> BoxFuture<'_, AgentResult>;
}

/// Text-generation collaborator consumed by LLM-backed agents.
pub trait CompletionClient: Send + Sync + 'static {
    fn complete(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, std::result::Result<Completion, AgentError>>;
}

/// External storage notified whenever a node completes.
///
/// Failures are reported back to the engine, which logs them and carries on.
pub trait PersistenceSink: Send + Sync + 'static {
    fn save_artifact(&self, run_id: &RunId, artifact: &Artifact) -> BoxFuture<'_, Result<()>>;

    fn save_message(&self, run_id: &RunId, message: &RunMessage) -> BoxFuture<'_, Result<()>>;
}

/// Receives streamed content fragments while an agent is still running.
pub trait FragmentSink: Send + Sync + 'static {
    fn push(&self, fragment: &str);
}
