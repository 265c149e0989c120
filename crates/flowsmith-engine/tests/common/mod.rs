#![allow(dead_code)]

use std::sync::Arc;

use flowsmith_core::config::{EngineConfig, RetryConfig};
use flowsmith_engine::{AgentRegistry, Edge, Engine, Node, WorkflowGraph};
use flowsmith_test_utils::{CallLog, StubAgent};

/// Config with instant retries.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.engine.retry = RetryConfig::immediate();
    config.engine.attempt_timeout_secs = 5;
    config
}

/// Registry with a stub agent for every built-in role id.
pub fn stub_registry(log: &CallLog) -> AgentRegistry {
    let registry = AgentRegistry::new();
    for id in ["planner", "coder", "reviewer", "security", "executor"] {
        registry.register(StubAgent::new(id, log.clone()));
    }
    registry
}

pub fn engine_with(registry: AgentRegistry) -> Engine {
    Engine::new(Arc::new(registry), fast_config())
}

/// start -> agent(agent_id) -> end
pub fn single_agent(agent_id: &str) -> WorkflowGraph {
    WorkflowGraph::new("single", "single agent")
        .with_node(Node::start("start"))
        .with_node(Node::agent("work", agent_id))
        .with_node(Node::agent("after", "reviewer"))
        .with_node(Node::end("end"))
        .with_edge(Edge::always("start", "work"))
        .with_edge(Edge::always("work", "after"))
        .with_edge(Edge::always("after", "end"))
}

/// start -> plan -> gate {approve -> build -> end, reject -> notes -> end}
pub fn approval_graph() -> WorkflowGraph {
    WorkflowGraph::new("approval", "approval")
        .with_node(Node::start("start"))
        .with_node(Node::agent("plan", "planner"))
        .with_node(Node::decision("gate", ["approve", "reject"]).with_prompt("Proceed?"))
        .with_node(Node::agent("build", "coder"))
        .with_node(Node::agent("notes", "reviewer"))
        .with_node(Node::end("end"))
        .with_edge(Edge::always("start", "plan"))
        .with_edge(Edge::always("plan", "gate"))
        .with_edge(Edge::on_choice("gate", "build", "approve"))
        .with_edge(Edge::on_choice("gate", "notes", "reject"))
        .with_edge(Edge::always("build", "end"))
        .with_edge(Edge::always("notes", "end"))
}
