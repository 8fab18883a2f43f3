// src/runtime/extensions.rs
//! Optional per-agent services: messaging, memory and task management
//!
//! Each service is attached after construction. Calls made before a
//! service is attached fail with [`RuntimeError::NotSetUp`].

use crate::utils::errors::{Result, RuntimeError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Which optional service a call needed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    Messaging,
    Memory,
    TaskManager,
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Extension::Messaging => "messaging",
            Extension::Memory => "memory",
            Extension::TaskManager => "task manager",
        };
        f.write_str(name)
    }
}

/// Inter-agent messaging
#[async_trait]
pub trait MessagingService: Send + Sync {
    /// Begin delivering messages to `agent_id` until `cancel` fires
    async fn start(&self, agent_id: &str, cancel: CancellationToken) -> Result<()>;

    async fn stop(&self, agent_id: &str) -> Result<()>;

    /// Returns the message ID
    async fn send(&self, from: &str, to: &str, payload: Bytes) -> Result<String>;
}

/// Per-agent key/value memory
#[async_trait]
pub trait MemoryService: Send + Sync {
    async fn remember(&self, agent_id: &str, key: &str, value: Bytes) -> Result<()>;

    async fn recall(&self, agent_id: &str, key: &str) -> Result<Option<Bytes>>;

    async fn forget(&self, agent_id: &str, key: &str) -> Result<()>;

    /// Start background synchronisation until `cancel` fires
    async fn start_sync(&self, agent_id: &str, cancel: CancellationToken) -> Result<()>;

    async fn stop_sync(&self, agent_id: &str) -> Result<()>;
}

/// External scheduling of work onto an agent
#[async_trait]
pub trait TaskManagerService: Send + Sync {
    async fn start(&self, agent_id: &str, cancel: CancellationToken) -> Result<()>;

    async fn stop(&self, agent_id: &str) -> Result<()>;
}

/// Slots for the optional services of one agent
#[derive(Default)]
pub struct AgentExtensions {
    messaging: RwLock<Option<Arc<dyn MessagingService>>>,
    memory: RwLock<Option<Arc<dyn MemoryService>>>,
    task_manager: RwLock<Option<Arc<dyn TaskManagerService>>>,
}

impl AgentExtensions {
    pub fn set_messaging(&self, service: Arc<dyn MessagingService>) {
        *self.messaging.write() = Some(service);
    }

    pub fn set_memory(&self, service: Arc<dyn MemoryService>) {
        *self.memory.write() = Some(service);
    }

    pub fn set_task_manager(&self, service: Arc<dyn TaskManagerService>) {
        *self.task_manager.write() = Some(service);
    }

    pub fn messaging(&self) -> Result<Arc<dyn MessagingService>> {
        self.messaging
            .read()
            .clone()
            .ok_or(RuntimeError::NotSetUp(Extension::Messaging))
    }

    pub fn memory(&self) -> Result<Arc<dyn MemoryService>> {
        self.memory
            .read()
            .clone()
            .ok_or(RuntimeError::NotSetUp(Extension::Memory))
    }

    pub fn task_manager(&self) -> Result<Arc<dyn TaskManagerService>> {
        self.task_manager
            .read()
            .clone()
            .ok_or(RuntimeError::NotSetUp(Extension::TaskManager))
    }
}
