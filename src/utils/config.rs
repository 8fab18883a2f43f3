// src/utils/config.rs
//! Layered runtime configuration
//!
//! Settings are read from an optional `cortex.{toml,yaml,json}` file (or the
//! file named by `CORTEX_CONFIG`) and then overridden by environment
//! variables such as `CORTEX_MANAGER__MAX_AGENTS=50`.

use crate::observability::LogFormat;
use crate::orchestration::coordinator::CoordinatorConfig;
use crate::runtime::agent::AgentConfig;
use crate::runtime::manager::ManagerConfig;
use crate::utils::errors::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "CORTEX_CONFIG";

/// Default config file stem (extension is probed by the loader)
pub const DEFAULT_CONFIG_NAME: &str = "cortex";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub manager: ManagerConfig,
    pub coordinator: CoordinatorConfig,
    pub registry: RegistryConfig,
    pub observability: ObservabilityConfig,
    pub agent_types: AgentTypesConfig,
    /// Agents created (and optionally started) when the daemon boots
    pub bootstrap: Vec<BootstrapAgent>,
}

impl RuntimeConfig {
    /// Load from the default location plus environment overrides
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_NAME.to_string());
        Self::load_from(&path)
    }

    /// Load from `path` (missing file is fine) plus environment overrides
    pub fn load_from(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("CORTEX")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: RuntimeConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.manager.max_agents == 0 {
            return Err(RuntimeError::InvalidConfig(
                "manager.max_agents must be greater than zero".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.coordinator.health_threshold) {
            return Err(RuntimeError::InvalidConfig(format!(
                "coordinator.health_threshold must be within [0, 1], got {}",
                self.coordinator.health_threshold
            )));
        }

        if self.registry.backend == RegistryBackend::Sqlite && self.registry.path.is_none() {
            return Err(RuntimeError::InvalidConfig(
                "registry.path is required for the sqlite backend".to_string(),
            ));
        }

        for agent in &self.bootstrap {
            if agent.name.trim().is_empty() {
                return Err(RuntimeError::InvalidConfig(
                    "bootstrap agents need a name".to_string(),
                ));
            }
            if let Some(config) = &agent.config {
                config.validate()?;
            }
        }

        Ok(())
    }
}

/// Which [`AgentRegistry`](crate::registry::AgentRegistry) backs the manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    #[default]
    Memory,
    Sqlite,
    /// Cache only, nothing persisted
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    /// Database file for the sqlite backend
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub log_level: String,
    pub log_format: LogFormat,
    /// Prometheus scrape endpoint; exporter disabled when absent
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            metrics_addr: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentTypesConfig {
    /// Directory of `*.json` / `*.yaml` agent type definitions
    pub directory: Option<PathBuf>,
}

/// Agent declared in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapAgent {
    pub name: String,
    pub agent_type: String,
    /// Explicit config; when absent the agent type's defaults apply
    #[serde(default)]
    pub config: Option<AgentConfig>,
    #[serde(default = "default_true")]
    pub start: bool,
}

fn default_true() -> bool {
    true
}

/// Serde adapter storing a `Duration` as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
