use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::types::AgentConfig;

/// Top-level flowsmith configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: SchedulerConfig,
    #[serde(default)]
    pub model: ModelDefaults,
    #[serde(default)]
    pub marketplace: MarketplaceConfig,
    #[serde(default)]
    pub templates: TemplatesConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Total attempts per agent node, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Upper bound on a single agent invocation attempt.
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
    /// Capacity of the run event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl SchedulerConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            attempt_timeout_secs: default_attempt_timeout(),
            event_capacity: default_event_capacity(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_attempt_timeout() -> u64 { 120 }
fn default_event_capacity() -> usize { 256 }

/// Backoff between agent attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    /// No waiting between attempts.
    pub fn immediate() -> Self {
        Self {
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 10_000 }

/// Model settings applied to agent nodes that leave them unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefaults {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub streaming: bool,
}

impl ModelDefaults {
    /// Fill every unset field of a node's agent configuration.
    pub fn fill(&self, config: &AgentConfig) -> AgentConfig {
        AgentConfig {
            model: Some(config.model.clone().unwrap_or_else(|| self.model.clone())),
            temperature: Some(config.temperature.unwrap_or(self.temperature)),
            max_tokens: Some(config.max_tokens.unwrap_or(self.max_tokens)),
            streaming: Some(config.streaming.unwrap_or(self.streaming)),
            system_prompt: config.system_prompt.clone(),
        }
    }
}

impl Default for ModelDefaults {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            streaming: false,
        }
    }
}

fn default_model() -> String { "gpt-4o-mini".to_string() }
fn default_temperature() -> f32 { 0.2 }
fn default_max_tokens() -> u32 { 4096 }

/// Marketplace agent discovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketplaceConfig {
    /// Directory of `<name>/agent.toml` manifests.
    #[serde(default)]
    pub agents_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplatesConfig {
    /// Directory of extra `*.json` workflow graphs.
    #[serde(default)]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database holding run snapshots. Disabled when unset.
    #[serde(default)]
    pub path: Option<String>,
}

/// Run journal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable the run journal (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for journal files. Default: ./runs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run lifecycle, 2 = + node lifecycle and decisions, 3 = every log entry (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl LogConfig {
    pub fn dir(&self) -> PathBuf {
        expand_home(self.log_dir.as_deref().unwrap_or("runs"))
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl EngineConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.engine.max_attempts == 0 {
            return Err(FlowError::Config("engine.max_attempts must be at least 1".into()));
        }
        if self.engine.event_capacity == 0 {
            return Err(FlowError::Config("engine.event_capacity must be at least 1".into()));
        }
        if let Some(ref log) = self.log {
            if !(1..=3).contains(&log.level) {
                return Err(FlowError::Config(format!(
                    "log.level must be 1, 2 or 3 (got {})",
                    log.level
                )));
            }
        }
        Ok(())
    }

    pub fn agents_dir(&self) -> Option<PathBuf> {
        self.marketplace.agents_dir.as_deref().map(expand_home)
    }

    pub fn templates_dir(&self) -> Option<PathBuf> {
        self.templates.dir.as_deref().map(expand_home)
    }

    pub fn store_path(&self) -> Option<PathBuf> {
        self.store.path.as_deref().map(expand_home)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Resolve a leading `~/` against `$HOME`.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_FLOWSMITH_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_FLOWSMITH_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_FLOWSMITH_VAR");
    }

    #[test]
    fn test_unset_env_var_kept() {
        let result = expand_env_vars("key = \"${FLOWSMITH_SURELY_UNSET_VAR}\"");
        assert_eq!(result, "key = \"${FLOWSMITH_SURELY_UNSET_VAR}\"");
    }

    #[test]
    fn test_model_defaults_fill_only_unset() {
        let defaults = ModelDefaults::default();
        let node = AgentConfig::default().with_model("local-llama");
        let filled = defaults.fill(&node);
        assert_eq!(filled.model.as_deref(), Some("local-llama"));
        assert_eq!(filled.max_tokens, Some(4096));
        assert_eq!(filled.streaming, Some(false));
        assert_eq!(filled.system_prompt, None);
    }

    #[test]
    fn test_empty_toml_is_all_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_attempts, 3);
        assert_eq!(config.engine.attempt_timeout_secs, 120);
        assert!(config.log.is_none());
        assert!(config.store_path().is_none());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config: EngineConfig = toml::from_str("[engine]\nmax_attempts = 0").unwrap();
        assert!(matches!(config.check(), Err(FlowError::Config(_))));
    }
}
