// src/utils/errors.rs
//! Error types for the agent runtime
//!
//! Every fallible operation in the crate returns [`Result`]. Variants are
//! grouped into capacity, state, infrastructure and shutdown failures so
//! callers can decide between retrying, backing off or giving up.

use crate::runtime::agent::AgentState;
use crate::runtime::extensions::Extension;
use std::time::Duration;
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors surfaced by the runtime manager, agents, registry and coordinator
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("maximum number of agents reached ({max})")]
    AgentLimitReached { max: usize },

    #[error("task queue is full for agent {agent_id} (capacity {capacity})")]
    QueueFull { agent_id: String, capacity: usize },

    #[error("agent {agent_id} is at maximum capacity ({load}/{max} tasks)")]
    AgentOverloaded {
        agent_id: String,
        load: usize,
        max: usize,
    },

    #[error("agent {agent_id} health score {score:.2} is below threshold {threshold:.2}")]
    AgentUnhealthy {
        agent_id: String,
        score: f64,
        threshold: f64,
    },

    #[error("agent {agent_id} cannot move from {from} to {to}")]
    InvalidStateTransition {
        agent_id: String,
        from: AgentState,
        to: AgentState,
    },

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent is stopped: {0}")]
    AgentStopped(String),

    #[error("task {task_id} timed out after {timeout:?}")]
    TaskTimeout { task_id: String, timeout: Duration },

    #[error("task {task_id} failed: {reason}")]
    TaskFailed { task_id: String, reason: String },

    #[error("no available agents")]
    NoAgentsAvailable,

    #[error("no agents match selection criteria")]
    NoMatchingAgents,

    #[error("assignment lease for agent {0} has expired")]
    LeaseExpired(String),

    #[error("assignment permit is for agent {expected}, not {actual}")]
    PermitMismatch { expected: String, actual: String },

    #[error("registry error: {0}")]
    Registry(String),

    #[error("runtime manager is shutting down")]
    ShuttingDown,

    #[error("shutdown timeout exceeded after {0:?}")]
    ShutdownTimeout(Duration),

    #[error("agent {agent_id} did not stop within {after:?}")]
    RestartTimeout { agent_id: String, after: Duration },

    #[error("{0} services not set up")]
    NotSetUp(Extension),

    #[error("unknown agent type: {0}")]
    UnknownAgentType(String),

    #[error("agent type is disabled: {0}")]
    AgentTypeDisabled(String),

    #[error("circular dependency detected involving {0}")]
    DependencyCycle(String),

    #[error("unknown graph node: {0}")]
    UnknownNode(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("observability setup failed: {0}")]
    Observability(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification of a [`RuntimeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Back off and retry later
    Capacity,
    /// The target is in the wrong state for the request
    State,
    /// Storage, configuration or I/O trouble
    Infrastructure,
    /// The runtime is going away
    Shutdown,
    /// The task ran and did not succeed
    Task,
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AgentLimitReached { .. }
            | Self::QueueFull { .. }
            | Self::AgentOverloaded { .. }
            | Self::AgentUnhealthy { .. }
            | Self::NoAgentsAvailable
            | Self::NoMatchingAgents
            | Self::LeaseExpired(_) => ErrorKind::Capacity,

            Self::InvalidStateTransition { .. }
            | Self::AgentNotFound(_)
            | Self::AgentStopped(_)
            | Self::PermitMismatch { .. }
            | Self::NotSetUp(_)
            | Self::UnknownAgentType(_)
            | Self::AgentTypeDisabled(_)
            | Self::DependencyCycle(_)
            | Self::UnknownNode(_) => ErrorKind::State,

            Self::TaskTimeout { .. } | Self::TaskFailed { .. } => ErrorKind::Task,

            Self::ShuttingDown | Self::ShutdownTimeout(_) | Self::RestartTimeout { .. } => {
                ErrorKind::Shutdown
            }

            Self::Registry(_)
            | Self::InvalidConfig(_)
            | Self::Config(_)
            | Self::Observability(_)
            | Self::Io(_)
            | Self::Serialization(_) => ErrorKind::Infrastructure,
        }
    }

    /// Whether the same request may succeed if retried later
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Capacity
    }
}
