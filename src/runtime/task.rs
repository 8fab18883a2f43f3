// src/runtime/task.rs
//! Tasks, task results and the pluggable handlers that execute them
//!
//! A [`Task`] is opaque to the runtime: its `task_type` selects a
//! [`TaskHandler`] from the [`TaskHandlerRegistry`] and its payload is
//! handed to that handler untouched.

use crate::utils::errors::RuntimeError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A unit of work submitted to an agent
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique task ID
    pub id: String,

    /// Selects the handler that executes this task
    pub task_type: String,

    /// Opaque payload passed to the handler
    pub payload: Bytes,

    /// Task priority (higher = more urgent)
    pub priority: i32,

    /// Overrides the agent's task timeout when set
    pub timeout: Option<Duration>,

    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            task_type: task_type.into(),
            payload: payload.into(),
            priority: 0,
            timeout: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Why a task did not produce output
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task execution timeout after {0:?}")]
    Timeout(Duration),

    #[error("task failed: {0}")]
    Failed(String),

    #[error("task handler panicked: {0}")]
    Panicked(String),

    #[error("no handler registered for task type '{0}'")]
    NoHandler(String),

    #[error("agent stopped before the task completed")]
    AgentStopped,

    /// Reported to the agent's error channel; moves the agent to Failed
    #[error("fatal agent error: {0}")]
    Fatal(String),
}

/// Outcome of a single task
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub agent_id: String,
    pub success: bool,
    pub output: Option<Bytes>,
    pub error: Option<TaskError>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration: Duration,
}

impl TaskResult {
    pub fn from_outcome(
        task_id: String,
        agent_id: String,
        outcome: std::result::Result<Bytes, TaskError>,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        let (success, output, error) = match outcome {
            Ok(output) => (true, Some(output), None),
            Err(error) => (false, None, Some(error)),
        };

        Self {
            task_id,
            agent_id,
            success,
            output,
            error,
            started_at,
            completed_at: Utc::now(),
            duration,
        }
    }

    /// Output on success, otherwise the failure as a [`RuntimeError`]
    pub fn into_output(self) -> crate::utils::errors::Result<Bytes> {
        match self.error {
            None => Ok(self.output.unwrap_or_default()),
            Some(TaskError::Timeout(timeout)) => Err(RuntimeError::TaskTimeout {
                task_id: self.task_id,
                timeout,
            }),
            Some(TaskError::AgentStopped) => Err(RuntimeError::AgentStopped(self.agent_id)),
            Some(other) => Err(RuntimeError::TaskFailed {
                task_id: self.task_id,
                reason: other.to_string(),
            }),
        }
    }

    /// Result for a task that was still queued when its agent stopped
    pub fn cancelled(task: &Task, agent_id: &str) -> Self {
        let now = Utc::now();
        Self {
            task_id: task.id.clone(),
            agent_id: agent_id.to_string(),
            success: false,
            output: None,
            error: Some(TaskError::AgentStopped),
            started_at: now,
            completed_at: now,
            duration: Duration::ZERO,
        }
    }
}

/// Executes tasks of one or more task types
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// `cancel` fires on timeout or when the owning agent stops
    async fn handle(&self, task: Task, cancel: CancellationToken)
        -> std::result::Result<Bytes, TaskError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Task, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Bytes, TaskError>> + Send + 'static,
{
    async fn handle(
        &self,
        task: Task,
        cancel: CancellationToken,
    ) -> std::result::Result<Bytes, TaskError> {
        (self.0)(task, cancel).await
    }
}

/// Wrap an async closure as a [`TaskHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Task, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Bytes, TaskError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Task type -> handler lookup with an optional fallback
#[derive(Default)]
pub struct TaskHandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    fallback: RwLock<Option<Arc<dyn TaskHandler>>>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler`, replacing any previous one for `task_type`
    pub fn register(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.write().insert(task_type.into(), handler);
    }

    pub fn set_fallback(&self, handler: Arc<dyn TaskHandler>) {
        *self.fallback.write() = Some(handler);
    }

    pub fn resolve(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        if let Some(handler) = self.handlers.read().get(task_type) {
            return Some(Arc::clone(handler));
        }
        self.fallback.read().clone()
    }

    /// Registered task types, sorted
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }
}

/// Returns the payload unchanged
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(
        &self,
        task: Task,
        _cancel: CancellationToken,
    ) -> std::result::Result<Bytes, TaskError> {
        Ok(task.payload)
    }
}

/// Sleeps for the number of milliseconds in the payload (UTF-8 digits)
pub struct SleepHandler {
    pub default_delay: Duration,
}

impl Default for SleepHandler {
    fn default() -> Self {
        Self {
            default_delay: Duration::from_millis(100),
        }
    }
}

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn handle(
        &self,
        task: Task,
        cancel: CancellationToken,
    ) -> std::result::Result<Bytes, TaskError> {
        let delay = std::str::from_utf8(&task.payload)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(self.default_delay);

        tokio::select! {
            _ = cancel.cancelled() => Err(TaskError::Failed("cancelled".to_string())),
            _ = tokio::time::sleep(delay) => {
                Ok(Bytes::from(format!("slept {}ms", delay.as_millis())))
            }
        }
    }
}
