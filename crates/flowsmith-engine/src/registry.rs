use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use flowsmith_core::config::ModelDefaults;
use flowsmith_core::error::{FlowError, Result};
use flowsmith_core::traits::{AgentHandler, CompletionClient};

use crate::agents::{BuiltinRole, LlmAgent};
use crate::marketplace::{load_manifests, AgentManifest};

/// Maps agent ids to the capability that runs them.
///
/// Registration takes `&self`, so agents installed while the engine is running
/// are visible to runs started afterwards. A run resolves each agent when it
/// reaches the node.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<dyn AgentHandler>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the five built-in roles backed by `client`.
    pub fn with_builtins(client: Arc<dyn CompletionClient>, defaults: ModelDefaults) -> Self {
        let registry = Self::new();
        for role in BuiltinRole::ALL {
            registry.register(LlmAgent::builtin(role, client.clone(), defaults.clone()));
        }
        registry
    }

    /// Register an agent, replacing any earlier one with the same id.
    pub fn register(&self, agent: impl AgentHandler) {
        self.register_arc(Arc::new(agent));
    }

    pub fn register_arc(&self, agent: Arc<dyn AgentHandler>) {
        let id = agent.id().to_string();
        self.agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, agent);
    }

    /// Unregister an agent by id.
    pub fn unregister(&self, id: &str) -> bool {
        self.agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<dyn AgentHandler>> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::AgentNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Registered agent ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Install a marketplace agent.
    pub fn install(
        &self,
        manifest: &AgentManifest,
        client: Arc<dyn CompletionClient>,
        defaults: ModelDefaults,
    ) {
        info!(agent = %manifest.id, name = %manifest.display_name(), "Installed marketplace agent");
        self.register(LlmAgent::from_manifest(manifest, client, defaults));
    }

    /// Remove an installed agent. Same as `unregister`.
    pub fn uninstall(&self, id: &str) -> bool {
        let removed = self.unregister(id);
        if removed {
            info!(agent = %id, "Uninstalled agent");
        }
        removed
    }

    /// Install every manifest under `dir`. Returns the number installed.
    pub fn load_marketplace(
        &self,
        dir: &Path,
        client: Arc<dyn CompletionClient>,
        defaults: &ModelDefaults,
    ) -> usize {
        let manifests = load_manifests(dir);
        let count = manifests.len();
        for manifest in &manifests {
            self.install(manifest, client.clone(), defaults.clone());
        }
        count
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
