use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, warn};

use flowsmith_core::error::{FlowError, Result};

use crate::graph::{validate, Edge, Node, WorkflowGraph};

/// Catalog listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub nodes: usize,
}

/// Named workflow graphs usable as seeds for new runs.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: BTreeMap<String, WorkflowGraph>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the built-in templates.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for graph in [code_review(), full_stack(), plan_approval(), review_loop()] {
            catalog.templates.insert(graph.id.clone(), graph);
        }
        catalog
    }

    /// Add a template after validating it. Replaces an existing id.
    pub fn register(&mut self, graph: WorkflowGraph) -> Result<()> {
        validate(&graph)?;
        self.templates.insert(graph.id.clone(), graph);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<&WorkflowGraph> {
        self.templates
            .get(id)
            .ok_or_else(|| FlowError::TemplateNotFound(id.to_string()))
    }

    /// A fresh copy of a template, ready to be started as a new graph.
    pub fn instantiate(&self, id: &str) -> Result<WorkflowGraph> {
        let mut graph = self.get(id)?.clone();
        let now = chrono::Utc::now();
        graph.created_at = now;
        graph.updated_at = now;
        Ok(graph)
    }

    pub fn list(&self) -> Vec<TemplateSummary> {
        self.templates
            .values()
            .map(|g| TemplateSummary {
                id: g.id.clone(),
                name: g.name.clone(),
                description: g.description.clone(),
                nodes: g.nodes.len(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Register every valid `*.json` graph in `dir`. Returns the number added.
    pub fn load_dir(&mut self, dir: &Path) -> usize {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                debug!(path = %dir.display(), error = %e, "Cannot read templates directory");
                return 0;
            }
        };

        let mut paths: Vec<_> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let graph = match std::fs::read_to_string(&path)
                .map_err(FlowError::from)
                .and_then(|json| WorkflowGraph::from_json(&json))
            {
                Ok(g) => g,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read template");
                    continue;
                }
            };
            match self.register(graph) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping invalid template"),
            }
        }
        loaded
    }
}

/// Chain agent nodes between Start and End in the order given.
fn pipeline(id: &str, name: &str, description: &str, steps: &[(&str, &str)]) -> WorkflowGraph {
    let mut graph = WorkflowGraph::new(id, name)
        .with_description(description)
        .with_node(Node::start("start").at(0.0, 0.0));
    let mut prev = "start".to_string();
    for (i, (node_id, agent_id)) in steps.iter().enumerate() {
        graph = graph
            .with_node(Node::agent(*node_id, *agent_id).at(0.0, 120.0 * (i + 1) as f32))
            .with_edge(Edge::always(prev.as_str(), *node_id));
        prev = node_id.to_string();
    }
    graph
        .with_node(Node::end("end").at(0.0, 120.0 * (steps.len() + 1) as f32))
        .with_edge(Edge::always(prev.as_str(), "end"))
}

fn code_review() -> WorkflowGraph {
    pipeline(
        "code-review",
        "Code & Review",
        "Generate code, then review it",
        &[("code", "coder"), ("review", "reviewer")],
    )
}

fn full_stack() -> WorkflowGraph {
    pipeline(
        "full-stack",
        "Full Stack Build",
        "Plan, implement, review, audit and describe how to run",
        &[
            ("plan", "planner"),
            ("code", "coder"),
            ("review", "reviewer"),
            ("audit", "security"),
            ("run", "executor"),
        ],
    )
}

fn plan_approval() -> WorkflowGraph {
    WorkflowGraph::new("plan-approval", "Plan Approval")
        .with_description("Plan first; a human approves before any code is written")
        .with_node(Node::start("start").at(0.0, 0.0))
        .with_node(Node::agent("plan", "planner").at(0.0, 120.0))
        .with_node(
            Node::decision("approve-plan", ["approve", "reject"])
                .with_prompt("Approve this plan?")
                .at(0.0, 240.0),
        )
        .with_node(Node::agent("code", "coder").at(-150.0, 360.0))
        .with_node(Node::agent("review", "reviewer").at(-150.0, 480.0))
        .with_node(Node::end("end").at(0.0, 600.0))
        .with_edge(Edge::always("start", "plan"))
        .with_edge(Edge::always("plan", "approve-plan"))
        .with_edge(Edge::on_choice("approve-plan", "code", "approve"))
        .with_edge(Edge::on_choice("approve-plan", "end", "reject"))
        .with_edge(Edge::always("code", "review"))
        .with_edge(Edge::always("review", "end"))
}

fn review_loop() -> WorkflowGraph {
    WorkflowGraph::new("review-loop", "Review Loop")
        .with_description("Code and review until a human ships it")
        .with_node(Node::start("start").at(0.0, 0.0))
        .with_node(Node::agent("code", "coder").at(0.0, 120.0))
        .with_node(Node::agent("review", "reviewer").at(0.0, 240.0))
        .with_node(
            Node::decision("ship", ["ship", "revise"])
                .with_prompt("Ship it, or send it back for another pass?")
                .at(0.0, 360.0),
        )
        .with_node(Node::end("end").at(0.0, 480.0))
        .with_edge(Edge::always("start", "code"))
        .with_edge(Edge::always("code", "review"))
        .with_edge(Edge::always("review", "ship"))
        .with_edge(Edge::on_choice("ship", "end", "ship"))
        .with_edge(Edge::on_choice("ship", "code", "revise"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowsmith_core::error::ValidationError;

    #[test]
    fn test_builtins_validate() {
        let catalog = TemplateCatalog::builtin();
        assert_eq!(catalog.len(), 4);
        for summary in catalog.list() {
            let graph = catalog.get(&summary.id).unwrap();
            assert_eq!(validate(graph), Ok(()), "template {} is invalid", summary.id);
        }
    }

    #[test]
    fn test_list_sorted_by_id() {
        let ids: Vec<_> = TemplateCatalog::builtin()
            .list()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["code-review", "full-stack", "plan-approval", "review-loop"]);
    }

    #[test]
    fn test_unknown_template() {
        let catalog = TemplateCatalog::builtin();
        assert!(matches!(
            catalog.instantiate("nope"),
            Err(FlowError::TemplateNotFound(ref id)) if id == "nope"
        ));
    }

    #[test]
    fn test_full_stack_order() {
        let graph = TemplateCatalog::builtin().instantiate("full-stack").unwrap();
        let mut order = vec![];
        let mut current = "start";
        while let Some(edge) = graph.successor(current) {
            order.push(edge.target.as_str());
            current = &edge.target;
        }
        assert_eq!(order, vec!["plan", "code", "review", "audit", "run", "end"]);
    }

    #[test]
    fn test_register_rejects_invalid() {
        let mut catalog = TemplateCatalog::new();
        let err = catalog
            .register(WorkflowGraph::new("bad", "bad").with_node(Node::end("end")))
            .unwrap_err();
        assert!(matches!(err, FlowError::Validation(ValidationError::MissingStart)));
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        let graph = pipeline("docs", "Docs", "", &[("write", "doc-writer")]);
        std::fs::write(dir.path().join("docs.json"), graph.to_json_pretty().unwrap()).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut catalog = TemplateCatalog::builtin();
        assert_eq!(catalog.load_dir(dir.path()), 1);
        assert_eq!(catalog.get("docs").unwrap().nodes.len(), 3);
    }
}
