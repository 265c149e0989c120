use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use flowsmith_core::types::AgentConfig;

/// TOML manifest for an installable agent.
///
/// Lives at `<agents_dir>/<name>/agent.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentManifest {
    /// Registry id used by graph nodes (e.g. "doc-writer").
    pub id: String,

    /// Display name. Defaults to the id.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: String,

    /// Role instructions sent ahead of any node-level system prompt.
    pub system_prompt: String,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// The agent must return at least one generated file.
    #[serde(default)]
    pub requires_files: bool,
}

impl AgentManifest {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Model settings declared by the manifest. The role prompt is kept separate.
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            streaming: None,
            system_prompt: None,
        }
    }
}

/// Load every manifest under `dir`, skipping unreadable or malformed entries.
pub fn load_manifests(dir: &Path) -> Vec<AgentManifest> {
    let mut manifests = Vec::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "Cannot read agents directory");
            return manifests;
        }
    };

    let mut dirs: Vec<_> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    for agent_dir in dirs {
        let manifest_path = agent_dir.join("agent.toml");
        if !manifest_path.exists() {
            debug!(path = %agent_dir.display(), "No agent.toml, skipping");
            continue;
        }

        let content = match std::fs::read_to_string(&manifest_path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %manifest_path.display(), error = %e, "Failed to read agent manifest");
                continue;
            }
        };

        let manifest: AgentManifest = match toml::from_str(&content) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %manifest_path.display(), error = %e, "Failed to parse agent manifest");
                continue;
            }
        };

        if manifest.id.trim().is_empty() {
            warn!(path = %manifest_path.display(), "Agent manifest has an empty id, skipping");
            continue;
        }

        manifests.push(manifest);
    }

    manifests
}
