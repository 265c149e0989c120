use std::io::Write;

use flowsmith_core::config::EngineConfig;
use flowsmith_core::error::FlowError;
use flowsmith_engine::{Edge, Node, TemplateCatalog, WorkflowGraph};

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(content.as_bytes()).expect("write toml");
    tmp
}

#[test]
fn test_load_full_config_from_file() {
    let tmp = write_config(
        r#"
[engine]
max_attempts = 5
attempt_timeout_secs = 30
event_capacity = 1024

[engine.retry]
initial_backoff_ms = 100
max_backoff_ms = 2000

[model]
model = "local-llama"
temperature = 0.7
max_tokens = 2048
streaming = true

[marketplace]
agents_dir = "/opt/flowsmith/agents"

[templates]
dir = "/opt/flowsmith/templates"

[store]
path = "/var/lib/flowsmith/runs.db"

[log]
log_dir = "/var/log/flowsmith"
level = 3
"#,
    );

    let config = EngineConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_attempts, 5);
    assert_eq!(config.engine.attempt_timeout_secs, 30);
    assert_eq!(config.engine.event_capacity, 1024);
    assert_eq!(config.engine.retry.initial_backoff_ms, 100);
    assert_eq!(config.engine.retry.max_backoff_ms, 2000);

    assert_eq!(config.model.model, "local-llama");
    assert_eq!(config.model.max_tokens, 2048);
    assert!(config.model.streaming);

    assert_eq!(
        config.agents_dir().unwrap().to_str(),
        Some("/opt/flowsmith/agents")
    );
    assert_eq!(
        config.templates_dir().unwrap().to_str(),
        Some("/opt/flowsmith/templates")
    );
    assert_eq!(
        config.store_path().unwrap().to_str(),
        Some("/var/lib/flowsmith/runs.db")
    );

    let log = config.log.expect("log present");
    assert!(log.enabled);
    assert_eq!(log.level, 3);
    assert_eq!(log.dir().to_str(), Some("/var/log/flowsmith"));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("FLOWSMITH_TEST_STORE", "/tmp/expanded.db");

    let tmp = write_config(
        r#"
[store]
path = "${FLOWSMITH_TEST_STORE}"
"#,
    );

    let config = EngineConfig::load(tmp.path()).expect("load config");
    assert_eq!(
        config.store_path().unwrap().to_str(),
        Some("/tmp/expanded.db")
    );

    std::env::remove_var("FLOWSMITH_TEST_STORE");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let tmp = write_config(
        r#"
[model]
model = "llama3.2"
"#,
    );

    let config = EngineConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_attempts, 3);
    assert_eq!(config.engine.attempt_timeout_secs, 120);
    assert_eq!(config.engine.event_capacity, 256);
    assert_eq!(config.engine.retry.initial_backoff_ms, 500);
    assert_eq!(config.engine.retry.max_backoff_ms, 10_000);
    assert_eq!(config.model.max_tokens, 4096);
    assert!(!config.model.streaming);
    assert!(config.agents_dir().is_none());
    assert!(config.templates_dir().is_none());
    assert!(config.store_path().is_none());
    assert!(config.log.is_none());
}

#[test]
fn test_empty_log_section_enables_journal() {
    let tmp = write_config("[log]\n");
    let config = EngineConfig::load(tmp.path()).expect("load config");
    let log = config.log.expect("log present");
    assert!(log.enabled);
    assert_eq!(log.level, 2);
    assert!(log.log_dir.is_none());
}

#[test]
fn test_invalid_values_rejected() {
    for content in [
        "[engine]\nmax_attempts = 0\n",
        "[engine]\nevent_capacity = 0\n",
        "[log]\nlevel = 0\n",
        "[log]\nlevel = 4\n",
    ] {
        let tmp = write_config(content);
        assert!(
            matches!(EngineConfig::load(tmp.path()), Err(FlowError::Config(_))),
            "accepted: {}",
            content
        );
    }
}

#[test]
fn test_malformed_toml_rejected() {
    let tmp = write_config("[engine\nmax_attempts = 3\n");
    assert!(matches!(
        EngineConfig::load(tmp.path()),
        Err(FlowError::Config(_))
    ));
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");
    assert!(matches!(
        EngineConfig::load(&missing),
        Err(FlowError::ConfigNotFound(_))
    ));
}

#[test]
fn test_templates_dir_extends_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let graph = WorkflowGraph::new("triage", "Triage")
        .with_node(Node::start("start"))
        .with_node(Node::agent("look", "reviewer"))
        .with_node(Node::end("end"))
        .with_edge(Edge::always("start", "look"))
        .with_edge(Edge::always("look", "end"));
    std::fs::write(dir.path().join("triage.json"), graph.to_json_pretty().unwrap()).unwrap();
    std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();

    let tmp = write_config(&format!(
        "[templates]\ndir = \"{}\"\n",
        dir.path().display()
    ));
    let config = EngineConfig::load(tmp.path()).expect("load config");

    let mut catalog = TemplateCatalog::builtin();
    let builtin = catalog.len();
    assert_eq!(catalog.load_dir(&config.templates_dir().unwrap()), 1);
    assert_eq!(catalog.len(), builtin + 1);
    assert_eq!(catalog.get("triage").unwrap().nodes.len(), 3);
}
