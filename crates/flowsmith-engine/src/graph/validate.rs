//! Structural validation, run before any run is created.
//!
//! Rules enforced, in order:
//! 1. Node ids are unique.
//! 2. Every edge references existing nodes.
//! 3. Exactly one Start node, with no incoming edges.
//! 4. Out-degree: Start and Agent nodes have exactly one unconditional edge,
//!    End nodes none; decision nodes have one conditional edge per option.
//! 5. Every node is reachable from Start.
//! 6. Unconditional edges form no cycle. Conditional edges out of a decision
//!    node may loop back (e.g. "revise").

use std::collections::{HashMap, HashSet, VecDeque};

use flowsmith_core::error::ValidationError;

use super::node::NodeKind;
use super::workflow::WorkflowGraph;

/// Check a graph's structural invariants, failing on the first violation.
///
/// Side-effect free; agent configuration is never inspected beyond the
/// presence of an agent id.
pub fn validate(graph: &WorkflowGraph) -> Result<(), ValidationError> {
    // 1. Unique node ids
    let mut seen: HashSet<&str> = HashSet::new();
    for node in &graph.nodes {
        if !seen.insert(node.id.as_str()) {
            return Err(ValidationError::DuplicateNodeId {
                node_id: node.id.clone(),
            });
        }
    }

    // 2. Edge endpoints
    for edge in &graph.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !seen.contains(endpoint.as_str()) {
                return Err(ValidationError::DanglingEdge {
                    edge_id: edge.id.clone(),
                    node_id: endpoint.clone(),
                });
            }
        }
    }

    // 3. Start node
    let starts: Vec<&str> = graph
        .nodes
        .iter()
        .filter(|n| n.is_start())
        .map(|n| n.id.as_str())
        .collect();
    let start = match starts.as_slice() {
        [] => return Err(ValidationError::MissingStart),
        [only] => *only,
        many => {
            return Err(ValidationError::MultipleStarts {
                node_ids: many.iter().map(|s| s.to_string()).collect(),
            })
        }
    };
    if let Some(edge) = graph.incoming(start).next() {
        return Err(ValidationError::StartHasIncoming {
            node_id: start.to_string(),
            edge_id: edge.id.clone(),
        });
    }

    // 4. Per-kind out-degree and payload checks
    for node in &graph.nodes {
        let outgoing: Vec<_> = graph.outgoing(&node.id).collect();
        let expected = match &node.kind {
            NodeKind::Start => 1,
            NodeKind::Agent { agent_id, .. } => {
                if agent_id.trim().is_empty() {
                    return Err(ValidationError::MissingAgentId {
                        node_id: node.id.clone(),
                    });
                }
                1
            }
            NodeKind::End => 0,
            NodeKind::HumanDecision { options, .. } => {
                check_decision(&node.id, options, &outgoing)?;
                continue;
            }
        };
        let unconditional = outgoing.iter().filter(|e| e.is_unconditional()).count();
        if unconditional != expected || outgoing.len() != expected {
            return Err(ValidationError::InvalidOutDegree {
                node_id: node.id.clone(),
                expected,
                found: outgoing.len(),
            });
        }
    }

    // 5. Reachability from Start over every edge
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &graph.edges {
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }
    let mut reached: HashSet<&str> = HashSet::from([start]);
    let mut queue: VecDeque<&str> = VecDeque::from([start]);
    while let Some(id) = queue.pop_front() {
        for &next in adjacency.get(id).map(Vec::as_slice).unwrap_or_default() {
            if reached.insert(next) {
                queue.push_back(next);
            }
        }
    }
    if let Some(node) = graph.nodes.iter().find(|n| !reached.contains(n.id.as_str())) {
        return Err(ValidationError::UnreachableNode {
            node_id: node.id.clone(),
        });
    }

    // 6. Kahn's algorithm over unconditional edges only
    let mut in_degree: HashMap<&str, usize> = graph.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in graph.edges.iter().filter(|e| e.is_unconditional()) {
        successors
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
        *in_degree.entry(edge.target.as_str()).or_insert(0) += 1;
    }
    let mut ready: VecDeque<&str> = graph
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();
    let mut sorted = 0usize;
    while let Some(id) = ready.pop_front() {
        sorted += 1;
        for &next in successors.get(id).map(Vec::as_slice).unwrap_or_default() {
            if let Some(deg) = in_degree.get_mut(next) {
                *deg -= 1;
                if *deg == 0 {
                    ready.push_back(next);
                }
            }
        }
    }
    if sorted != graph.nodes.len() {
        // Nodes left with positive in-degree sit on (or behind) a cycle.
        let node_id = graph
            .nodes
            .iter()
            .find(|n| in_degree.get(n.id.as_str()).is_some_and(|d| *d > 0))
            .map(|n| n.id.clone())
            .unwrap_or_default();
        return Err(ValidationError::CycleDetected { node_id });
    }

    Ok(())
}

/// Decision edges must be conditional, unique per option, and cover the options exactly.
fn check_decision(
    node_id: &str,
    options: &[String],
    outgoing: &[&super::edge::Edge],
) -> Result<(), ValidationError> {
    let mismatch = |reason: String| ValidationError::DecisionOptionMismatch {
        node_id: node_id.to_string(),
        reason,
    };

    if options.is_empty() {
        return Err(mismatch("no options declared".into()));
    }
    let mut declared: HashSet<&str> = HashSet::new();
    for option in options {
        if !declared.insert(option.as_str()) {
            return Err(mismatch(format!("option '{}' declared twice", option)));
        }
    }

    let mut covered: HashSet<&str> = HashSet::new();
    for edge in outgoing {
        let Some(condition) = edge.condition.as_deref() else {
            return Err(mismatch(format!("edge '{}' has no condition", edge.id)));
        };
        if !declared.contains(condition) {
            return Err(mismatch(format!(
                "edge '{}' condition '{}' is not a declared option",
                edge.id, condition
            )));
        }
        if !covered.insert(condition) {
            return Err(mismatch(format!(
                "more than one edge for option '{}'",
                condition
            )));
        }
    }

    if let Some(missing) = options.iter().find(|o| !covered.contains(o.as_str())) {
        return Err(mismatch(format!("option '{}' has no outgoing edge", missing)));
    }
    Ok(())
}
