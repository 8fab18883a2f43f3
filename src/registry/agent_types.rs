// src/registry/agent_types.rs
//! Agent type catalog
//!
//! An agent type names a kind of agent, the capabilities it brings and
//! the defaults applied when an agent of that type is created. The catalog
//! starts with the built-in `worker`, `coordinator` and `monitor` types and
//! can be extended from a directory of JSON or YAML definitions.

use crate::runtime::agent::AgentConfig;
use crate::utils::errors::{Result, RuntimeError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Optional overrides applied on top of [`AgentConfig::default`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentTypeDefaults {
    pub max_concurrent_tasks: Option<usize>,
    pub task_queue_size: Option<usize>,
    pub heartbeat_interval_ms: Option<u64>,
    pub task_timeout_ms: Option<u64>,
    pub pool: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentType {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub optional_capabilities: Vec<String>,
    #[serde(default)]
    pub default_config: AgentTypeDefaults,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_enabled() -> bool {
    true
}

impl AgentType {
    fn builtin(id: &str, description: &str, category: &str, capabilities: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            version: default_version(),
            required_capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            optional_capabilities: Vec::new(),
            default_config: AgentTypeDefaults::default(),
            metadata: HashMap::new(),
            is_enabled: true,
        }
    }

    /// Agent config derived from this type's defaults
    pub fn agent_config(&self) -> AgentConfig {
        let defaults = &self.default_config;
        let base = AgentConfig::default();

        let mut capabilities = self.required_capabilities.clone();
        for capability in &self.optional_capabilities {
            if !capabilities.contains(capability) {
                capabilities.push(capability.clone());
            }
        }

        AgentConfig {
            max_concurrent_tasks: defaults
                .max_concurrent_tasks
                .unwrap_or(base.max_concurrent_tasks),
            task_queue_size: defaults.task_queue_size.unwrap_or(base.task_queue_size),
            heartbeat_interval: defaults
                .heartbeat_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(base.heartbeat_interval),
            task_timeout: defaults
                .task_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(base.task_timeout),
            capabilities,
            pool: defaults.pool.clone(),
            ..base
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(RuntimeError::InvalidConfig(
                "agent type id cannot be empty".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(RuntimeError::InvalidConfig(format!(
                "agent type {} needs a name",
                self.id
            )));
        }
        Ok(())
    }
}

pub struct AgentTypeCatalog {
    types: RwLock<BTreeMap<String, AgentType>>,
}

impl Default for AgentTypeCatalog {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl AgentTypeCatalog {
    pub fn empty() -> Self {
        Self {
            types: RwLock::new(BTreeMap::new()),
        }
    }

    /// Catalog holding `worker`, `coordinator` and `monitor`
    pub fn with_builtins() -> Self {
        let catalog = Self::empty();
        for agent_type in [
            AgentType::builtin("worker", "General purpose task executor", "core", &["execute"]),
            AgentType::builtin(
                "coordinator",
                "Distributes work across other agents",
                "core",
                &["coordinate", "execute"],
            ),
            AgentType::builtin("monitor", "Observes agent health", "core", &["monitor"]),
        ] {
            catalog.types.write().insert(agent_type.id.clone(), agent_type);
        }
        catalog
    }

    /// Add or replace a type
    pub fn register(&self, agent_type: AgentType) -> Result<()> {
        agent_type.validate()?;
        debug!("Registering agent type {}", agent_type.id);
        self.types.write().insert(agent_type.id.clone(), agent_type);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<AgentType> {
        self.types.read().get(id).cloned()
    }

    /// All types ordered by ID
    pub fn list(&self) -> Vec<AgentType> {
        self.types.read().values().cloned().collect()
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut types = self.types.write();
        let agent_type = types
            .get_mut(id)
            .ok_or_else(|| RuntimeError::UnknownAgentType(id.to_string()))?;
        agent_type.is_enabled = enabled;
        Ok(())
    }

    /// The config for a new agent of `type_id`
    pub fn resolve(&self, type_id: &str) -> Result<AgentConfig> {
        let types = self.types.read();
        let agent_type = types
            .get(type_id)
            .ok_or_else(|| RuntimeError::UnknownAgentType(type_id.to_string()))?;

        if !agent_type.is_enabled {
            return Err(RuntimeError::AgentTypeDisabled(type_id.to_string()));
        }

        Ok(agent_type.agent_config())
    }

    /// Load every `*.json`, `*.yaml` and `*.yml` file in `dir`
    ///
    /// Returns the number of types registered. Unreadable files are skipped
    /// with a warning.
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase());

            let parsed: Result<AgentType> = match extension.as_deref() {
                Some("json") => std::fs::read_to_string(&path)
                    .map_err(RuntimeError::from)
                    .and_then(|text| serde_json::from_str(&text).map_err(RuntimeError::from)),
                Some("yaml") | Some("yml") => std::fs::read_to_string(&path)
                    .map_err(RuntimeError::from)
                    .and_then(|text| {
                        serde_yaml::from_str(&text)
                            .map_err(|e| RuntimeError::InvalidConfig(e.to_string()))
                    }),
                _ => continue,
            };

            match parsed.and_then(|agent_type| self.register(agent_type)) {
                Ok(()) => loaded += 1,
                Err(e) => warn!("Skipping agent type file {:?}: {}", path, e),
            }
        }

        info!("Loaded {} agent types from {:?}", loaded, dir);
        Ok(loaded)
    }
}
