// src/lib.rs
//! Cortex multi-agent runtime
//!
//! This library creates, schedules and supervises independent agent
//! workers, routes tasks to them and coordinates their lifecycle with
//! health monitoring and graceful shutdown.
//!
//! # Architecture
//!
//! The runtime is structured into several key modules:
//!
//! - **runtime**: agents, task execution, worker pools and the manager
//! - **orchestration**: agent selection, load tracking and task assignment
//! - **registry**: durable agent records and the agent type catalog
//! - **observability**: tracing and Prometheus setup for the daemon
//! - **utils**: configuration and error types

// Public module exports
pub mod observability;
pub mod orchestration;
pub mod registry;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use orchestration::{AgentCoordinator, AgentSelector, AssignmentPermit, SelectionStrategy};
pub use runtime::{Agent, AgentConfig, AgentState, RuntimeManager, Task, TaskResult};
pub use utils::config::RuntimeConfig;
pub use utils::errors::{Result, RuntimeError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Runtime build information
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert_eq!(info.version, VERSION);
        assert!(!info.git_hash.is_empty());
    }
}
