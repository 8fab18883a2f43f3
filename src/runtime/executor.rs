// src/runtime/executor.rs
//! Task executor
//!
//! Runs one task on behalf of an agent under a deadline. The handler is
//! spawned onto its own tokio task and raced against the timeout and the
//! agent's cancellation; whichever fires first decides the outcome. A
//! handler that loses the race is signalled through its cancellation token
//! and left to finish on its own.

use crate::runtime::agent::Agent;
use crate::runtime::metrics::MetricsRecorder;
use crate::runtime::task::{Task, TaskError, TaskHandlerRegistry, TaskResult};
use bytes::Bytes;
use chrono::Utc;
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct TaskExecutor {
    handlers: Arc<TaskHandlerRegistry>,
    metrics: Arc<MetricsRecorder>,
}

impl TaskExecutor {
    pub fn new(handlers: Arc<TaskHandlerRegistry>, metrics: Arc<MetricsRecorder>) -> Self {
        Self { handlers, metrics }
    }

    pub fn handlers(&self) -> &Arc<TaskHandlerRegistry> {
        &self.handlers
    }

    /// Execute `task` on `agent`; always yields a result
    pub async fn execute(&self, agent: &Agent, task: Task) -> TaskResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let task_id = task.id.clone();
        let timeout = task.timeout.unwrap_or(agent.config().task_timeout);

        let running = self.metrics.task_started();
        let active = agent.begin_task();

        debug!("Agent {} executing task {} ({})", agent.id(), task_id, task.task_type);
        let outcome = self.run(agent, task, timeout).await;

        let success = outcome.is_ok();
        active.finish(success);
        drop(running);
        self.metrics.task_finished(success, clock.elapsed());

        TaskResult::from_outcome(
            task_id,
            agent.id().to_string(),
            outcome,
            started_at,
            clock.elapsed(),
        )
    }

    async fn run(
        &self,
        agent: &Agent,
        task: Task,
        timeout: Duration,
    ) -> std::result::Result<Bytes, TaskError> {
        let Some(handler) = self.handlers.resolve(&task.task_type) else {
            return Err(TaskError::NoHandler(task.task_type));
        };

        let agent_token = agent.cancellation_token();
        let task_token = agent_token.child_token();
        let task_id = task.id.clone();

        let mut handle = {
            let token = task_token.clone();
            tokio::spawn(async move { handler.handle(task, token).await })
        };

        // Agent cancellation is checked first: the handler sees the same
        // cancellation through its child token and may already have returned
        tokio::select! {
            biased;
            _ = agent_token.cancelled() => {
                task_token.cancel();
                debug!("Agent {} stopped while task {} was running", agent.id(), task_id);
                Err(TaskError::AgentStopped)
            }
            joined = &mut handle => match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => Err(TaskError::Panicked(panic_message(e.into_panic()))),
                Err(e) => Err(TaskError::Failed(e.to_string())),
            },
            _ = tokio::time::sleep(timeout) => {
                task_token.cancel();
                warn!("Task {} on agent {} timed out after {:?}", task_id, agent.id(), timeout);
                Err(TaskError::Timeout(timeout))
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
