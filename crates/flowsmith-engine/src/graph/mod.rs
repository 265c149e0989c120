//! Workflow graph model.
//!
//! A workflow is a directed graph of `Node`s connected by `Edge`s. Node kinds
//! are Start, Agent, HumanDecision and End. Edges out of a decision node carry
//! the option label that selects them; all other edges are unconditional.
//!
//! `validate` checks the structural invariants before any run is created.

pub mod edge;
pub mod node;
pub mod validate;
pub mod workflow;

pub use edge::Edge;
pub use node::{Node, NodeKind, Position};
pub use validate::validate;
pub use workflow::WorkflowGraph;
