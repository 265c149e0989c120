pub mod agents;
pub mod gate;
pub mod graph;
pub mod ledger;
pub mod marketplace;
pub mod registry;
pub mod retry;
pub mod run_log;
pub mod scheduler;
pub mod store;
pub mod templates;

pub use agents::{BuiltinRole, LlmAgent};
pub use gate::DecisionGate;
pub use graph::{validate, Edge, Node, NodeKind, Position, WorkflowGraph};
pub use ledger::{NodeFragments, RunLedger};
pub use marketplace::{load_manifests, AgentManifest};
pub use registry::AgentRegistry;
pub use retry::{Failure, RetryCoordinator, RetryOutcome};
pub use run_log::RunJournal;
pub use scheduler::Engine;
pub use store::{RunStore, RunSummary, StoredRun};
pub use templates::{TemplateCatalog, TemplateSummary};
