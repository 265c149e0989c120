use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use flowsmith_core::config::EngineConfig;
use flowsmith_core::types::{RunId, RunState};
use flowsmith_engine::{
    load_manifests, validate, BuiltinRole, NodeKind, RunStore, TemplateCatalog, WorkflowGraph,
};

#[derive(Parser)]
#[command(name = "flowsmith", version, about = "Multi-agent workflow orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowsmith.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List workflow templates
    Templates,
    /// Print a template as JSON
    Show {
        /// Template id
        id: String,
    },
    /// Check a workflow graph file
    Validate {
        /// Path to a graph JSON file
        path: PathBuf,
    },
    /// Show the effective configuration
    Config,
    /// List agents: built-in roles and installed marketplace agents
    Agents,
    /// List persisted runs
    Runs,
    /// Show a persisted run
    Inspect {
        /// Run id
        run_id: String,
        /// Also print the run log
        #[arg(long)]
        log: bool,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("flowsmith=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "flowsmith", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Templates => {
            let catalog = catalog(&config);
            println!("{:<16} {:<14} {:>5}  DESCRIPTION", "ID", "NAME", "NODES");
            for t in catalog.list() {
                println!(
                    "{:<16} {:<14} {:>5}  {}",
                    t.id,
                    truncate(&t.name, 14),
                    t.nodes,
                    t.description
                );
            }
        }
        Commands::Show { id } => {
            let catalog = catalog(&config);
            let graph = catalog.get(&id)?;
            println!("{}", graph.to_json_pretty()?);
        }
        Commands::Validate { path } => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let graph = WorkflowGraph::from_json(&content)?;
            match validate(&graph) {
                Ok(()) => {
                    println!(
                        "{}: ok ({} nodes, {} edges)",
                        graph.id,
                        graph.nodes.len(),
                        graph.edges.len()
                    );
                    print_agent_refs(&graph);
                }
                Err(e) => anyhow::bail!("{}: {}", graph.id, e),
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Agents => {
            println!("Built-in:");
            for role in BuiltinRole::ALL {
                println!("  {:<12} {}", role.id(), role.description());
            }
            if let Some(dir) = config.agents_dir() {
                let manifests = load_manifests(&dir);
                println!("\nMarketplace ({}):", dir.display());
                if manifests.is_empty() {
                    println!("  No agents installed.");
                }
                for m in &manifests {
                    println!("  {:<12} {}", m.id, m.description);
                }
            }
        }
        Commands::Runs => {
            let store = open_store(&config)?;
            let runs = store.list()?;
            if runs.is_empty() {
                println!("No runs recorded.");
                return Ok(());
            }
            println!("{:<38} {:<16} {:<20} UPDATED", "RUN", "GRAPH", "STATUS");
            for r in runs {
                println!(
                    "{:<38} {:<16} {:<20} {}",
                    r.run_id,
                    truncate(&r.graph_id, 16),
                    r.status,
                    r.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Inspect { run_id, log } => {
            let store = open_store(&config)?;
            let run_id = RunId::from_string(&run_id);
            let stored = store
                .load(&run_id)?
                .ok_or_else(|| anyhow::anyhow!("run not found: {}", run_id))?;
            print_run(&stored.state, &stored.graph, log);
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if path.exists() {
        debug!(path = %path.display(), "Loading config");
        return Ok(EngineConfig::load(path)?);
    }
    info!(path = %path.display(), "No config file found, using defaults");
    Ok(EngineConfig::default())
}

fn catalog(config: &EngineConfig) -> TemplateCatalog {
    let mut catalog = TemplateCatalog::builtin();
    if let Some(dir) = config.templates_dir() {
        let loaded = catalog.load_dir(&dir);
        debug!(dir = %dir.display(), loaded, "Loaded extra templates");
    }
    catalog
}

fn open_store(config: &EngineConfig) -> anyhow::Result<RunStore> {
    let path = config
        .store_path()
        .ok_or_else(|| anyhow::anyhow!("no run store configured; set [store] path"))?;
    if !path.exists() {
        anyhow::bail!("run store not found: {}", path.display());
    }
    Ok(RunStore::open(&path)?)
}

fn print_agent_refs(graph: &WorkflowGraph) {
    let mut agents: Vec<&str> = graph.nodes.iter().filter_map(|n| n.agent_id()).collect();
    agents.sort_unstable();
    agents.dedup();
    if !agents.is_empty() {
        println!("agents: {}", agents.join(", "));
    }
}

fn print_run(state: &RunState, graph: &WorkflowGraph, with_log: bool) {
    println!("Run:      {}", state.run_id);
    println!("Graph:    {} ({})", graph.name, state.graph_id);
    println!("Status:   {}", state.status);
    println!("Started:  {}", state.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(finished) = state.finished_at {
        println!("Finished: {}", finished.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(ref err) = state.last_error {
        println!("Error:    {}", err);
    }
    if !state.input.is_empty() {
        println!("Input:    {}", truncate(&state.input, 72));
    }

    println!("\nNodes:");
    for node in &graph.nodes {
        let detail = match &node.kind {
            NodeKind::Agent { agent_id, .. } => format!(" [{}]", agent_id),
            _ => String::new(),
        };
        println!(
            "  {:<16} {:<10} {}{}",
            node.id,
            node.kind_name(),
            serde_json::to_value(state.node_status(&node.id))
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            detail
        );
    }

    if let Some(ref pending) = state.pending_decision {
        println!("\nWaiting on '{}': {}", pending.node_id, pending.options.join(" | "));
        if let Some(ref prompt) = pending.prompt {
            println!("  {}", prompt);
        }
    }

    if !state.artifacts.is_empty() {
        println!("\nArtifacts:");
        for a in &state.artifacts {
            println!("  {} ({} bytes, from {})", a.path, a.content.len(), a.produced_by_node_id);
        }
    }

    if with_log {
        println!("\nLog:");
        for e in &state.log {
            let level = serde_json::to_value(e.level)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            let attempt = e.attempt.map(|a| format!(" #{}", a)).unwrap_or_default();
            println!(
                "  {:>4} {:<5} {:<12}{} {}",
                e.sequence,
                level,
                e.node_id.as_deref().unwrap_or("-"),
                attempt,
                e.message
            );
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
