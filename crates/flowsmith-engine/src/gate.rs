use tracing::info;

use flowsmith_core::error::DecisionError;
use flowsmith_core::types::{LogLevel, PendingDecision};

use crate::graph::{Edge, WorkflowGraph};
use crate::ledger::RunLedger;

/// Suspends a run at a human-decision node and resumes it along the chosen edge.
///
/// Suspension is a pure state transition: the pending decision is recorded in
/// the ledger and the traversal task returns. Nothing waits on a channel, so a
/// suspended run can be rebuilt from its persisted `RunState`.
pub struct DecisionGate;

impl DecisionGate {
    /// Park the run on `node_id` until one of `options` is chosen.
    pub fn suspend(
        ledger: &RunLedger,
        node_id: &str,
        prompt: Option<String>,
        options: &[String],
    ) -> PendingDecision {
        let decision = PendingDecision {
            node_id: node_id.to_string(),
            prompt,
            options: options.to_vec(),
        };
        ledger.log(
            Some(node_id),
            LogLevel::Info,
            format!("waiting on decision: {}", options.join(" | ")),
        );
        ledger.suspend(decision.clone());
        info!(run_id = %ledger.run_id(), node_id, "Run waiting on decision");
        decision
    }

    /// Validate a choice and return the edge to follow.
    ///
    /// On error the ledger is left untouched.
    pub fn resume<'g>(
        ledger: &RunLedger,
        graph: &'g WorkflowGraph,
        node_id: &str,
        option: &str,
    ) -> Result<&'g Edge, DecisionError> {
        ledger.check_decision(node_id, option)?;
        let edge = graph
            .choice_edge(node_id, option)
            .ok_or_else(|| DecisionError::UnknownOption {
                option: option.to_string(),
                expected: graph
                    .outgoing(node_id)
                    .filter_map(|e| e.condition.clone())
                    .collect(),
            })?;
        ledger.take_decision(node_id, option)?;
        ledger.log(
            Some(node_id),
            LogLevel::Info,
            format!("decision '{}' -> {}", option, edge.target),
        );
        info!(run_id = %ledger.run_id(), node_id, option, target = %edge.target, "Decision resolved");
        Ok(edge)
    }
}
