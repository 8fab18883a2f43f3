// src/registry/mod.rs
//! Durable agent records
//!
//! The runtime manager keeps live [`Agent`](crate::runtime::agent::Agent)s in
//! memory and mirrors their metadata into an [`AgentRegistry`] so they
//! survive a process restart. Two backends ship with the crate:
//!
//! - [`InMemoryRegistry`]: DashMap-backed, for tests and single-process use
//! - [`SqliteRegistry`]: a single-table SQLite store
//!
//! [`AgentTypeCatalog`] lives here too: it describes which agent kinds may
//! be created and their default configuration.

pub mod agent_types;
pub mod memory;
pub mod sqlite;

pub use agent_types::{AgentType, AgentTypeCatalog, AgentTypeDefaults};
pub use memory::InMemoryRegistry;
pub use sqlite::SqliteRegistry;

use crate::runtime::agent::{AgentConfig, AgentState};
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Persisted snapshot of an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    pub state: AgentState,
    pub metadata: HashMap<String, String>,
    pub config: AgentConfig,
    pub is_healthy: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Storage for agent records
///
/// `create` fails when the ID exists; `update` and `delete` fail with
/// `AgentNotFound` when it does not. `list` is ordered by ID.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn create(&self, record: &AgentRecord) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<AgentRecord>>;

    async fn list(&self) -> Result<Vec<AgentRecord>>;

    async fn update(&self, record: &AgentRecord) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;
}
