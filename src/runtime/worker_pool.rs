// src/runtime/worker_pool.rs
//! Per-agent worker pool and supervision loop
//!
//! Starting an agent launches one [`AgentWorkerPool`]:
//!
//! ```text
//! AgentWorkerPool (supervisor)
//! ├─ worker 0..N   pop task ─► executor ─► results channel (2N)
//! ├─ heartbeat     tick every heartbeat_interval
//! └─ select on     manager shutdown | agent cancel | agent faults | results
//! ```
//!
//! When the supervisor exits it drains results still in flight, then turns
//! every task left in the queue into an `AgentStopped` result.

use crate::registry::AgentRegistry;
use crate::runtime::agent::{Agent, AgentFault, AgentState};
use crate::runtime::executor::TaskExecutor;
use crate::runtime::metrics::MetricsRecorder;
use crate::runtime::task::{TaskError, TaskResult};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

enum Exit {
    ManagerShutdown,
    Cancelled,
    Fault(AgentFault),
}

/// Supervises the workers of one running agent
pub struct AgentWorkerPool {
    agent: Arc<Agent>,
    executor: Arc<TaskExecutor>,
    metrics: Arc<MetricsRecorder>,
    results: broadcast::Sender<TaskResult>,
    shutdown: CancellationToken,
    registry: Option<Arc<dyn AgentRegistry>>,
}

impl AgentWorkerPool {
    pub fn new(
        agent: Arc<Agent>,
        executor: Arc<TaskExecutor>,
        metrics: Arc<MetricsRecorder>,
        results: broadcast::Sender<TaskResult>,
        shutdown: CancellationToken,
        registry: Option<Arc<dyn AgentRegistry>>,
    ) -> Self {
        Self {
            agent,
            executor,
            metrics,
            results,
            shutdown,
            registry,
        }
    }

    /// Run until the agent is stopped, fails, or the manager shuts down
    pub async fn run(self) {
        let agent_id = self.agent.id().to_string();
        let worker_count = self.agent.config().max_concurrent_tasks;
        let token = self.agent.cancellation_token();

        let (results_tx, mut results_rx) = mpsc::channel::<TaskResult>(worker_count * 2);
        let mut workers = JoinSet::new();

        for worker_id in 0..worker_count {
            workers.spawn(worker_loop(
                Arc::clone(&self.agent),
                Arc::clone(&self.executor),
                worker_id,
                results_tx.clone(),
                token.clone(),
            ));
        }
        workers.spawn(heartbeat_loop(Arc::clone(&self.agent), token.clone()));
        drop(results_tx);

        info!("Agent {} running with {} workers", agent_id, worker_count);

        let exit = {
            let mut faults = self.agent.fault_receiver().await;
            loop {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break Exit::ManagerShutdown,
                    _ = token.cancelled() => break Exit::Cancelled,
                    Some(fault) = faults.recv() => break Exit::Fault(fault),
                    Some(result) = results_rx.recv() => self.handle_result(result),
                }
            }
        };

        match exit {
            Exit::Fault(fault) => {
                error!(
                    "Agent {} failed: {} (task: {:?})",
                    agent_id, fault.message, fault.task_id
                );
                match self.agent.transition(AgentState::Failed) {
                    Ok(_) => {
                        self.metrics.agent_failed();
                        self.agent.cancel();
                        self.persist().await;
                    }
                    Err(e) => debug!("Agent {} not marked failed: {}", agent_id, e),
                }
            }
            Exit::ManagerShutdown => {
                debug!("Agent {} supervisor observed manager shutdown", agent_id);
                self.agent.cancel();
                if self.agent.state() != AgentState::Failed {
                    self.agent.set_state(AgentState::Stopped);
                }
            }
            Exit::Cancelled => {
                debug!("Agent {} supervisor observed cancellation", agent_id);
            }
        }

        // Workers observe the cancelled token and close the channel on exit
        while let Some(result) = results_rx.recv().await {
            self.handle_result(result);
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!("Agent {} worker ended abnormally: {}", agent_id, e);
            }
        }

        let leftover = self.agent.queue().drain();
        if !leftover.is_empty() {
            info!(
                "Agent {} cancelling {} queued tasks",
                agent_id,
                leftover.len()
            );
            self.metrics.tasks_cancelled(leftover.len() as u64);
            for task in &leftover {
                let _ = self.results.send(TaskResult::cancelled(task, &agent_id));
            }
        }

        info!("Agent {} supervision loop exited", agent_id);
    }

    fn handle_result(&self, result: TaskResult) {
        if result.success {
            debug!(
                "Agent {} completed task {} in {:?}",
                result.agent_id, result.task_id, result.duration
            );
        } else {
            warn!(
                "Agent {} task {} failed: {}",
                result.agent_id,
                result.task_id,
                result
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default()
            );
        }

        if let Some(TaskError::Fatal(message)) = &result.error {
            self.agent
                .report_fault(AgentFault::for_task(message.clone(), result.task_id.clone()));
        }

        // No subscribers is fine
        let _ = self.results.send(result);
    }

    async fn persist(&self) {
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.update(&self.agent.to_record()).await {
                warn!("Failed to persist agent {}: {}", self.agent.id(), e);
            }
        }
    }
}

async fn worker_loop(
    agent: Arc<Agent>,
    executor: Arc<TaskExecutor>,
    worker_id: usize,
    results: mpsc::Sender<TaskResult>,
    token: CancellationToken,
) {
    debug!("Agent {} worker {} started", agent.id(), worker_id);
    let mut paused = agent.pause_signal();

    'work: loop {
        // Hold between tasks while paused
        loop {
            let is_paused = *paused.borrow_and_update();
            if !is_paused {
                break;
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => break 'work,
                changed = paused.changed() => {
                    if changed.is_err() {
                        break 'work;
                    }
                }
            }
        }

        let task = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            changed = paused.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            task = agent.queue().pop() => task,
        };

        let result = executor.execute(&agent, task).await;
        if results.send(result).await.is_err() {
            break;
        }
    }

    debug!("Agent {} worker {} exited", agent.id(), worker_id);
}

async fn heartbeat_loop(agent: Arc<Agent>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(agent.config().heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => agent.update_heartbeat(),
        }
    }
}
