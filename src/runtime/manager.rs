// src/runtime/manager.rs
//! Runtime manager: owns the agent population
//!
//! The manager enforces the agent cap, drives lifecycle transitions,
//! launches one [`AgentWorkerPool`] per running agent, mirrors agent state
//! into the optional [`AgentRegistry`] and runs a periodic health scan.
//!
//! Registry writes on create and delete are fatal; state updates after a
//! transition are best effort and only logged when they fail.
//!
//! Start, stop, restart and delete of one agent are serialized on that
//! agent's lifecycle lock.

use crate::registry::{AgentRecord, AgentRegistry, AgentTypeCatalog};
use crate::runtime::agent::{Agent, AgentConfig, AgentState};
use crate::runtime::executor::TaskExecutor;
use crate::runtime::metrics::{MetricsRecorder, RuntimeMetrics};
use crate::runtime::task::{Task, TaskHandler, TaskHandlerRegistry, TaskResult};
use crate::runtime::worker_pool::AgentWorkerPool;
use crate::utils::config::duration_ms;
use crate::utils::errors::{Result, RuntimeError};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Configuration for the runtime manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Maximum number of cached agents (default: 100)
    pub max_agents: usize,

    /// Period of the health scan (default: 30s)
    #[serde(rename = "health_check_interval_ms", with = "duration_ms")]
    pub health_check_interval: Duration,

    /// Bound on waiting for supervisors during shutdown (default: 30s)
    #[serde(rename = "shutdown_timeout_ms", with = "duration_ms")]
    pub shutdown_timeout: Duration,

    /// Bound on waiting for the old supervisor during restart (default: 5s)
    #[serde(rename = "restart_grace_ms", with = "duration_ms")]
    pub restart_grace: Duration,

    /// Mirror counters to the `metrics` facade
    pub enable_metrics: bool,

    /// Capacity of the task result broadcast channel
    pub result_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_agents: 100,
            health_check_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            restart_grace: Duration::from_secs(5),
            enable_metrics: true,
            result_buffer: 1024,
        }
    }
}

impl ManagerConfig {
    /// Replace zero values with defaults
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.max_agents == 0 {
            self.max_agents = defaults.max_agents;
        }
        if self.health_check_interval.is_zero() {
            self.health_check_interval = defaults.health_check_interval;
        }
        if self.shutdown_timeout.is_zero() {
            self.shutdown_timeout = defaults.shutdown_timeout;
        }
        if self.restart_grace.is_zero() {
            self.restart_grace = defaults.restart_grace;
        }
        if self.result_buffer == 0 {
            self.result_buffer = defaults.result_buffer;
        }
        self
    }
}

/// Builder for a [`RuntimeManager`] with a registry or custom catalog
pub struct RuntimeManagerBuilder {
    config: ManagerConfig,
    registry: Option<Arc<dyn AgentRegistry>>,
    catalog: AgentTypeCatalog,
    handlers: Arc<TaskHandlerRegistry>,
}

impl RuntimeManagerBuilder {
    pub fn registry(mut self, registry: Arc<dyn AgentRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn catalog(mut self, catalog: AgentTypeCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn handlers(mut self, handlers: Arc<TaskHandlerRegistry>) -> Self {
        self.handlers = handlers;
        self
    }

    /// Assemble the manager, restore persisted agents and start the health scan
    ///
    /// Must be called from within a tokio runtime.
    pub async fn build(self) -> Arc<RuntimeManager> {
        let manager = RuntimeManager::assemble(self);
        manager.load_from_registry().await;
        manager.spawn_health_loop();
        manager
    }
}

pub struct RuntimeManager {
    config: ManagerConfig,
    agents: RwLock<HashMap<String, Arc<Agent>>>,
    /// Slots claimed by creations still waiting on the registry
    reserved_slots: AtomicUsize,
    registry: Option<Arc<dyn AgentRegistry>>,
    catalog: AgentTypeCatalog,
    metrics: Arc<MetricsRecorder>,
    executor: Arc<TaskExecutor>,
    results: broadcast::Sender<TaskResult>,
    supervisors: Mutex<HashMap<String, JoinHandle<()>>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl RuntimeManager {
    pub fn builder(config: ManagerConfig) -> RuntimeManagerBuilder {
        RuntimeManagerBuilder {
            config,
            registry: None,
            catalog: AgentTypeCatalog::with_builtins(),
            handlers: Arc::new(TaskHandlerRegistry::new()),
        }
    }

    /// Manager without persistence; must be called from within a tokio runtime
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let manager = Self::assemble(Self::builder(config));
        manager.spawn_health_loop();
        manager
    }

    fn assemble(builder: RuntimeManagerBuilder) -> Arc<Self> {
        let config = builder.config.normalized();
        let metrics = Arc::new(MetricsRecorder::new(config.enable_metrics));
        let executor = Arc::new(TaskExecutor::new(builder.handlers, Arc::clone(&metrics)));
        let (results, _) = broadcast::channel(config.result_buffer);

        Arc::new(Self {
            config,
            agents: RwLock::new(HashMap::new()),
            reserved_slots: AtomicUsize::new(0),
            registry: builder.registry,
            catalog: builder.catalog,
            metrics,
            executor,
            results,
            supervisors: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn catalog(&self) -> &AgentTypeCatalog {
        &self.catalog
    }

    /// Route tasks of `task_type` to `handler`
    pub fn register_handler(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.executor.handlers().register(task_type, handler);
    }

    /// Handler for task types without a dedicated one
    pub fn set_fallback_handler(&self, handler: Arc<dyn TaskHandler>) {
        self.executor.handlers().set_fallback(handler);
    }

    /// Every task result produced from now on
    pub fn subscribe_results(&self) -> broadcast::Receiver<TaskResult> {
        self.results.subscribe()
    }

    /// Create an agent in the Created state
    pub async fn create_agent(
        &self,
        name: &str,
        agent_type: &str,
        config: AgentConfig,
    ) -> Result<Arc<Agent>> {
        if self.shutdown.is_cancelled() {
            return Err(RuntimeError::ShuttingDown);
        }

        let config = config.normalized();
        config.validate()?;
        self.reserve_slot()?;

        let agent = Arc::new(Agent::with_parent(name, agent_type, config, &self.shutdown));

        if let Some(registry) = &self.registry {
            if let Err(e) = registry.create(&agent.to_record()).await {
                self.reserved_slots.fetch_sub(1, Ordering::AcqRel);
                error!("Failed to persist new agent {}: {}", agent.id(), e);
                return Err(e);
            }
        }

        self.agents
            .write()
            .insert(agent.id().to_string(), Arc::clone(&agent));
        self.reserved_slots.fetch_sub(1, Ordering::AcqRel);
        self.metrics.agent_created();

        info!(
            "Created agent {} ({}) of type {}",
            agent.id(),
            agent.name(),
            agent.agent_type()
        );
        Ok(agent)
    }

    /// Create an agent using the defaults of a catalog type
    pub async fn create_agent_of_type(&self, name: &str, type_id: &str) -> Result<Arc<Agent>> {
        let config = self.catalog.resolve(type_id)?;
        self.create_agent(name, type_id, config).await
    }

    fn reserve_slot(&self) -> Result<()> {
        let agents = self.agents.write();
        self.check_capacity(agents.len())?;
        self.reserved_slots.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Must be called with the agents lock held
    fn check_capacity(&self, cached: usize) -> Result<()> {
        if cached + self.reserved_slots.load(Ordering::Acquire) >= self.config.max_agents {
            return Err(RuntimeError::AgentLimitReached {
                max: self.config.max_agents,
            });
        }
        Ok(())
    }

    /// Cache a restored agent; an entry already cached wins over `agent`
    fn admit(&self, agent: Arc<Agent>) -> Result<Arc<Agent>> {
        let mut agents = self.agents.write();
        if let Some(cached) = agents.get(agent.id()) {
            return Ok(Arc::clone(cached));
        }
        self.check_capacity(agents.len())?;
        agents.insert(agent.id().to_string(), Arc::clone(&agent));
        Ok(agent)
    }

    fn cached(&self, agent_id: &str) -> Result<Arc<Agent>> {
        self.agents
            .read()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| RuntimeError::AgentNotFound(agent_id.to_string()))
    }

    /// Start a Created agent, or resume a Paused one
    pub async fn start_agent(&self, agent_id: &str) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(RuntimeError::ShuttingDown);
        }

        let agent = self.cached(agent_id)?;
        let _lifecycle = agent.lifecycle_lock().await;
        self.start_locked(&agent).await
    }

    async fn start_locked(&self, agent: &Arc<Agent>) -> Result<()> {
        let previous = agent.transition(AgentState::Running)?;

        match previous {
            AgentState::Paused => {
                agent.set_paused(false);
                info!("Resumed agent {}", agent.id());
            }
            _ => {
                self.launch(agent);
                info!("Started agent {}", agent.id());
            }
        }

        self.persist(agent).await;
        Ok(())
    }

    fn launch(&self, agent: &Arc<Agent>) {
        agent.rearm(&self.shutdown);
        agent.set_paused(false);
        agent.update_heartbeat();

        let pool = AgentWorkerPool::new(
            Arc::clone(agent),
            Arc::clone(&self.executor),
            Arc::clone(&self.metrics),
            self.results.clone(),
            self.shutdown.clone(),
            self.registry.clone(),
        );
        let handle = self.tracker.spawn(pool.run());
        self.supervisors
            .lock()
            .insert(agent.id().to_string(), handle);
    }

    /// Stop an agent; stopping a Stopped or Failed agent is a no-op
    pub async fn stop_agent(&self, agent_id: &str) -> Result<()> {
        let agent = self.cached(agent_id)?;
        let _lifecycle = agent.lifecycle_lock().await;
        self.stop_locked(&agent).await;
        Ok(())
    }

    async fn stop_locked(&self, agent: &Agent) {
        match agent.stop() {
            None => debug!("Agent {} already stopped ({})", agent.id(), agent.state()),
            Some(previous) => {
                self.metrics.agent_stopped();
                self.persist(agent).await;
                info!("Stopped agent {} (was {})", agent.id(), previous);
            }
        }
    }

    /// Hold a Running agent's workers between tasks
    pub async fn pause_agent(&self, agent_id: &str) -> Result<()> {
        let agent = self.cached(agent_id)?;
        agent.transition_from(AgentState::Running, AgentState::Paused)?;
        agent.set_paused(true);
        self.persist(&agent).await;
        info!("Paused agent {}", agent_id);
        Ok(())
    }

    pub async fn resume_agent(&self, agent_id: &str) -> Result<()> {
        let agent = self.cached(agent_id)?;
        agent.transition_from(AgentState::Paused, AgentState::Running)?;
        agent.set_paused(false);
        self.persist(&agent).await;
        info!("Resumed agent {}", agent_id);
        Ok(())
    }

    /// Stop, wait for the old worker pool, then run again
    ///
    /// Valid from any state; a Created agent is simply started. Tasks still
    /// queued when the old pool exits are cancelled. Concurrent restarts of
    /// the same agent run one after the other.
    pub async fn restart_agent(&self, agent_id: &str) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(RuntimeError::ShuttingDown);
        }

        let agent = self.cached(agent_id)?;
        let _lifecycle = agent.lifecycle_lock().await;
        if self.shutdown.is_cancelled() {
            return Err(RuntimeError::ShuttingDown);
        }
        if agent.state() == AgentState::Created {
            return self.start_locked(&agent).await;
        }

        self.stop_locked(&agent).await;

        let previous_pool = self.supervisors.lock().remove(agent_id);
        if let Some(handle) = previous_pool {
            if tokio::time::timeout(self.config.restart_grace, handle)
                .await
                .is_err()
            {
                return Err(RuntimeError::RestartTimeout {
                    agent_id: agent_id.to_string(),
                    after: self.config.restart_grace,
                });
            }
        }

        agent.set_state(AgentState::Running);
        self.metrics.agent_reactivated();
        self.launch(&agent);
        self.persist(&agent).await;

        info!("Restarted agent {}", agent_id);
        Ok(())
    }

    /// Stop an agent and remove it from the cache and the registry
    pub async fn delete_agent(&self, agent_id: &str) -> Result<()> {
        let agent = self.cached(agent_id)?;
        let _lifecycle = agent.lifecycle_lock().await;
        self.stop_locked(&agent).await;

        if let Some(registry) = &self.registry {
            match registry.delete(agent_id).await {
                Ok(()) | Err(RuntimeError::AgentNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        self.agents.write().remove(agent_id);
        self.supervisors.lock().remove(agent_id);
        info!("Deleted agent {}", agent_id);
        Ok(())
    }

    /// Look up an agent, falling back to the registry on a cache miss
    pub async fn get_agent(&self, agent_id: &str) -> Result<Arc<Agent>> {
        if let Ok(agent) = self.cached(agent_id) {
            return Ok(agent);
        }

        let Some(registry) = &self.registry else {
            return Err(RuntimeError::AgentNotFound(agent_id.to_string()));
        };

        let record = registry
            .get(agent_id)
            .await?
            .ok_or_else(|| RuntimeError::AgentNotFound(agent_id.to_string()))?;

        let restored = self.restore(record);
        let agent = self.admit(Arc::clone(&restored))?;
        if Arc::ptr_eq(&agent, &restored) && agent.state() == AgentState::Created {
            self.metrics.agent_reactivated();
        }
        Ok(agent)
    }

    /// Cached agents ordered by ID
    pub fn list_agents(&self) -> Vec<Arc<Agent>> {
        let mut agents: Vec<Arc<Agent>> = self.agents.read().values().cloned().collect();
        agents.sort_by(|a, b| a.id().cmp(b.id()));
        agents
    }

    /// Records straight from the registry (empty without one)
    pub async fn list_registered(&self) -> Result<Vec<AgentRecord>> {
        match &self.registry {
            Some(registry) => registry.list().await,
            None => Ok(Vec::new()),
        }
    }

    pub fn agent_count(&self) -> usize {
        self.agents.read().len()
    }

    /// Enqueue a task on a cached agent
    pub fn submit_task(&self, agent_id: &str, task: Task) -> Result<()> {
        self.cached(agent_id)?.submit_task(task)
    }

    pub fn metrics(&self) -> RuntimeMetrics {
        self.metrics.snapshot()
    }

    /// Log live agents whose heartbeat is stale; returns their IDs
    pub fn check_agent_health(&self) -> Vec<String> {
        let mut unhealthy = Vec::new();

        for agent in self.list_agents() {
            if agent.is_healthy() {
                continue;
            }
            if agent.state().is_live() {
                warn!(
                    "Agent {} is unhealthy (state: {}, last heartbeat: {})",
                    agent.id(),
                    agent.state(),
                    agent.last_heartbeat()
                );
                unhealthy.push(agent.id().to_string());
            } else {
                debug!(
                    "Agent {} has no recent heartbeat (state: {})",
                    agent.id(),
                    agent.state()
                );
            }
        }

        unhealthy
    }

    /// Stop every agent and wait for the worker pools to exit
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down runtime manager");

        let agents = self.list_agents();
        let stops = agents
            .iter()
            .map(|agent| async move { (agent.id(), self.stop_agent(agent.id()).await) });
        for (agent_id, outcome) in join_all(stops).await {
            if let Err(e) = outcome {
                error!("Failed to stop agent {} during shutdown: {}", agent_id, e);
            }
        }

        self.shutdown.cancel();
        self.tracker.close();

        match tokio::time::timeout(self.config.shutdown_timeout, self.tracker.wait()).await {
            Ok(()) => {
                self.supervisors.lock().clear();
                info!("Runtime manager shutdown complete");
                Ok(())
            }
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?} with {} tasks outstanding",
                    self.config.shutdown_timeout,
                    self.tracker.len()
                );
                Err(RuntimeError::ShutdownTimeout(self.config.shutdown_timeout))
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn persist(&self, agent: &Agent) {
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.update(&agent.to_record()).await {
                warn!("Failed to persist agent {}: {}", agent.id(), e);
            }
        }
    }

    /// A persisted Running or Paused agent has no worker pool after a
    /// restart of the process, so it comes back Stopped
    fn restore(&self, record: AgentRecord) -> Arc<Agent> {
        let state = match record.state {
            AgentState::Running | AgentState::Paused => AgentState::Stopped,
            other => other,
        };
        let agent = Agent::from_record(record, state, &self.shutdown);
        if matches!(state, AgentState::Stopped | AgentState::Failed) {
            agent.cancel();
        }
        Arc::new(agent)
    }

    async fn load_from_registry(&self) {
        let Some(registry) = &self.registry else {
            return;
        };

        let records = match registry.list().await {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to load agents from registry: {}", e);
                return;
            }
        };

        let mut loaded = 0usize;
        let mut skipped = 0usize;
        let mut active = 0u64;
        for record in records {
            let agent = match self.admit(self.restore(record)) {
                Ok(agent) => agent,
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            };
            if !matches!(agent.state(), AgentState::Stopped | AgentState::Failed) {
                active += 1;
            }
            loaded += 1;
        }
        self.metrics.set_active_agents(active);

        if skipped > 0 {
            warn!(
                "Agent limit {} reached; {} registered agents left uncached",
                self.config.max_agents, skipped
            );
        }
        info!("Loaded {} agents from registry", loaded);
    }

    fn spawn_health_loop(self: &Arc<Self>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.health_check_interval;

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.check_agent_health();
                    }
                }
            }
            debug!("Health check loop exited");
        });
    }
}

impl Drop for RuntimeManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;
    use crate::runtime::task::{handler_fn, EchoHandler, SleepHandler, TaskError};
    use async_trait::async_trait;
    use bytes::Bytes;

    fn config(max_agents: usize) -> ManagerConfig {
        ManagerConfig {
            max_agents,
            enable_metrics: false,
            shutdown_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn agent_config() -> AgentConfig {
        AgentConfig {
            max_concurrent_tasks: 2,
            task_queue_size: 10,
            heartbeat_interval: Duration::from_millis(50),
            task_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    async fn next_result(rx: &mut broadcast::Receiver<TaskResult>) -> TaskResult {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a task result")
            .expect("result channel closed")
    }

    #[tokio::test]
    async fn test_create_agent() {
        let manager = RuntimeManager::new(config(10));
        let agent = manager
            .create_agent("worker-1", "worker", agent_config())
            .await
            .unwrap();

        assert_eq!(agent.state(), AgentState::Created);
        assert_eq!(manager.list_agents().len(), 1);
        assert_eq!(manager.metrics().total_agents_created, 1);
        assert_eq!(manager.metrics().current_active_agents, 1);
    }

    #[tokio::test]
    async fn test_agent_limit() {
        let manager = RuntimeManager::new(config(2));
        manager.create_agent("a", "worker", agent_config()).await.unwrap();
        manager.create_agent("b", "worker", agent_config()).await.unwrap();

        let err = manager
            .create_agent("c", "worker", agent_config())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AgentLimitReached { max: 2 }));
        assert_eq!(manager.agent_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_creation_respects_cap() {
        let manager = RuntimeManager::new(config(5));
        let attempts: Vec<_> = (0..20)
            .map(|i| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    manager
                        .create_agent(&format!("agent-{}", i), "worker", AgentConfig::default())
                        .await
                })
            })
            .collect();

        let mut created = 0;
        for attempt in attempts {
            if attempt.await.unwrap().is_ok() {
                created += 1;
            }
        }
        assert_eq!(created, 5);
        assert_eq!(manager.agent_count(), 5);
    }

    #[tokio::test]
    async fn test_start_unknown_agent() {
        let manager = RuntimeManager::new(config(10));
        assert!(matches!(
            manager.start_agent("missing").await,
            Err(RuntimeError::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_executes_tasks() {
        let manager = RuntimeManager::new(config(10));
        manager.register_handler("echo", Arc::new(EchoHandler));
        let mut results = manager.subscribe_results();

        let agent = manager.create_agent("a", "worker", agent_config()).await.unwrap();
        manager.start_agent(agent.id()).await.unwrap();
        assert_eq!(agent.state(), AgentState::Running);

        agent.submit_task(Task::new("echo", "hi").with_id("t1")).unwrap();
        let result = next_result(&mut results).await;
        assert_eq!(result.task_id, "t1");
        assert!(result.success);
        assert_eq!(result.output, Some(Bytes::from("hi")));
        assert_eq!(manager.metrics().total_tasks_executed, 1);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_running_agent_is_rejected() {
        let manager = RuntimeManager::new(config(10));
        let agent = manager.create_agent("a", "worker", agent_config()).await.unwrap();
        manager.start_agent(agent.id()).await.unwrap();

        assert!(matches!(
            manager.start_agent(agent.id()).await,
            Err(RuntimeError::InvalidStateTransition { .. })
        ));
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let manager = RuntimeManager::new(config(10));
        let agent = manager.create_agent("a", "worker", agent_config()).await.unwrap();
        manager.start_agent(agent.id()).await.unwrap();

        manager.stop_agent(agent.id()).await.unwrap();
        manager.stop_agent(agent.id()).await.unwrap();

        assert_eq!(agent.state(), AgentState::Stopped);
        let m = manager.metrics();
        assert_eq!(m.total_agents_stopped, 1);
        assert_eq!(m.current_active_agents, 0);
        assert!(matches!(
            agent.submit_task(Task::new("echo", "")),
            Err(RuntimeError::AgentStopped(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let manager = RuntimeManager::new(config(10));
        manager.register_handler("echo", Arc::new(EchoHandler));
        let mut results = manager.subscribe_results();

        let agent = manager.create_agent("a", "worker", agent_config()).await.unwrap();
        assert!(matches!(
            manager.pause_agent(agent.id()).await,
            Err(RuntimeError::InvalidStateTransition { .. })
        ));

        manager.start_agent(agent.id()).await.unwrap();
        manager.pause_agent(agent.id()).await.unwrap();
        assert_eq!(agent.state(), AgentState::Paused);

        agent.submit_task(Task::new("echo", "held").with_id("held")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(agent.queued_tasks(), 1);
        assert!(results.try_recv().is_err());

        // heartbeat keeps running while paused
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(agent.is_healthy());

        manager.resume_agent(agent.id()).await.unwrap();
        let result = next_result(&mut results).await;
        assert_eq!(result.task_id, "held");

        assert!(matches!(
            manager.resume_agent(agent.id()).await,
            Err(RuntimeError::InvalidStateTransition { .. })
        ));
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_on_paused_resumes() {
        let manager = RuntimeManager::new(config(10));
        let agent = manager.create_agent("a", "worker", agent_config()).await.unwrap();
        manager.start_agent(agent.id()).await.unwrap();
        manager.pause_agent(agent.id()).await.unwrap();

        manager.start_agent(agent.id()).await.unwrap();
        assert_eq!(agent.state(), AgentState::Running);
        assert!(!agent.is_paused());
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_runs_again() {
        let manager = RuntimeManager::new(config(10));
        manager.register_handler("echo", Arc::new(EchoHandler));
        let mut results = manager.subscribe_results();

        let agent = manager.create_agent("a", "worker", agent_config()).await.unwrap();
        manager.start_agent(agent.id()).await.unwrap();
        manager.restart_agent(agent.id()).await.unwrap();
        assert_eq!(agent.state(), AgentState::Running);
        assert!(!agent.is_cancelled());

        agent.submit_task(Task::new("echo", "again").with_id("after")).unwrap();
        let result = next_result(&mut results).await;
        assert_eq!(result.task_id, "after");
        assert!(result.success);
        assert_eq!(manager.metrics().current_active_agents, 1);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_created_agent_starts_it() {
        let manager = RuntimeManager::new(config(10));
        let agent = manager.create_agent("a", "worker", agent_config()).await.unwrap();
        manager.restart_agent(agent.id()).await.unwrap();
        assert_eq!(agent.state(), AgentState::Running);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_restarts_run_in_turn() {
        let manager = RuntimeManager::new(config(10));
        let agent = manager.create_agent("a", "worker", agent_config()).await.unwrap();
        manager.start_agent(agent.id()).await.unwrap();

        for _ in 0..5 {
            let (first, second) = tokio::time::timeout(Duration::from_secs(5), async {
                tokio::join!(
                    manager.restart_agent(agent.id()),
                    manager.restart_agent(agent.id())
                )
            })
            .await
            .expect("restarts did not finish");
            first.unwrap();
            second.unwrap();

            assert_eq!(agent.state(), AgentState::Running);
            assert_eq!(manager.supervisors.lock().len(), 1);
        }
        assert_eq!(manager.metrics().current_active_agents, 1);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_gives_up_on_stuck_pool() {
        let manager = RuntimeManager::new(ManagerConfig {
            restart_grace: Duration::from_millis(50),
            ..config(10)
        });
        let agent = manager.create_agent("a", "worker", agent_config()).await.unwrap();

        // the supervisor cannot leave while the error channel is held
        let faults = agent.fault_receiver().await;
        manager.start_agent(agent.id()).await.unwrap();

        let err = manager.restart_agent(agent.id()).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::RestartTimeout { ref agent_id, after }
                if agent_id == agent.id() && after == Duration::from_millis(50)
        ));
        assert_eq!(agent.state(), AgentState::Stopped);

        drop(faults);
        manager.restart_agent(agent.id()).await.unwrap();
        assert_eq!(agent.state(), AgentState::Running);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_gives_up_on_stuck_pool() {
        let manager = RuntimeManager::new(ManagerConfig {
            shutdown_timeout: Duration::from_millis(50),
            ..config(10)
        });
        let agent = manager.create_agent("a", "worker", agent_config()).await.unwrap();

        let faults = agent.fault_receiver().await;
        manager.start_agent(agent.id()).await.unwrap();

        let started = std::time::Instant::now();
        let err = manager.shutdown().await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::ShutdownTimeout(after) if after == Duration::from_millis(50)
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(agent.state(), AgentState::Stopped);
        drop(faults);
    }

    #[tokio::test]
    async fn test_stop_cancels_queued_tasks() {
        let manager = RuntimeManager::new(config(10));
        manager.register_handler("sleep", Arc::new(SleepHandler::default()));
        let mut results = manager.subscribe_results();

        let agent = manager
            .create_agent(
                "a",
                "worker",
                AgentConfig {
                    max_concurrent_tasks: 1,
                    ..agent_config()
                },
            )
            .await
            .unwrap();
        manager.start_agent(agent.id()).await.unwrap();

        for i in 0..4 {
            agent
                .submit_task(Task::new("sleep", "2000").with_id(format!("t{}", i)))
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.stop_agent(agent.id()).await.unwrap();

        let mut stopped = 0;
        for _ in 0..4 {
            let result = next_result(&mut results).await;
            assert_eq!(result.error, Some(TaskError::AgentStopped));
            stopped += 1;
        }
        assert_eq!(stopped, 4);
        assert_eq!(manager.metrics().total_tasks_cancelled, 3);
    }

    #[tokio::test]
    async fn test_fatal_task_fails_agent() {
        let manager = RuntimeManager::new(config(10));
        manager.register_handler(
            "doom",
            handler_fn(|_task, _cancel| async {
                Err::<Bytes, TaskError>(TaskError::Fatal("corrupted state".into()))
            }),
        );
        let mut results = manager.subscribe_results();

        let agent = manager.create_agent("a", "worker", agent_config()).await.unwrap();
        manager.start_agent(agent.id()).await.unwrap();
        agent.submit_task(Task::new("doom", "")).unwrap();

        let result = next_result(&mut results).await;
        assert_eq!(result.error, Some(TaskError::Fatal("corrupted state".into())));

        for _ in 0..50 {
            if agent.state() == AgentState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(agent.state(), AgentState::Failed);
        assert!(agent.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_agent_is_not_active() {
        let manager = RuntimeManager::new(config(10));
        manager.register_handler(
            "doom",
            handler_fn(|_task, _cancel| async {
                Err::<Bytes, TaskError>(TaskError::Fatal("corrupted state".into()))
            }),
        );

        let agent = manager.create_agent("a", "worker", agent_config()).await.unwrap();
        manager.start_agent(agent.id()).await.unwrap();
        agent.submit_task(Task::new("doom", "")).unwrap();

        for _ in 0..100 {
            if agent.state() == AgentState::Failed && manager.metrics().current_active_agents == 0
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(agent.state(), AgentState::Failed);
        assert_eq!(manager.metrics().current_active_agents, 0);

        // stopping a failed agent changes neither its state nor the counters
        manager.stop_agent(agent.id()).await.unwrap();
        assert_eq!(agent.state(), AgentState::Failed);
        let metrics = manager.metrics();
        assert_eq!(metrics.total_agents_stopped, 0);
        assert_eq!(metrics.current_active_agents, 0);

        manager.restart_agent(agent.id()).await.unwrap();
        assert_eq!(agent.state(), AgentState::Running);
        assert_eq!(manager.metrics().current_active_agents, 1);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_agents_sorted() {
        let manager = RuntimeManager::new(config(10));
        for name in ["x", "y", "z"] {
            manager.create_agent(name, "worker", agent_config()).await.unwrap();
        }
        let ids: Vec<String> = manager.list_agents().iter().map(|a| a.id().to_string()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn test_create_of_type_uses_catalog() {
        let manager = RuntimeManager::new(config(10));
        let agent = manager.create_agent_of_type("mon", "monitor").await.unwrap();
        assert_eq!(agent.agent_type(), "monitor");
        assert!(agent.config().has_capability("monitor"));

        assert!(matches!(
            manager.create_agent_of_type("x", "nonexistent").await,
            Err(RuntimeError::UnknownAgentType(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_mirrors_lifecycle() {
        let registry = Arc::new(InMemoryRegistry::new());
        let manager = RuntimeManager::builder(config(10))
            .registry(registry.clone())
            .build()
            .await;

        let agent = manager.create_agent("a", "worker", agent_config()).await.unwrap();
        manager.start_agent(agent.id()).await.unwrap();
        assert_eq!(
            registry.get(agent.id()).await.unwrap().unwrap().state,
            AgentState::Running
        );

        manager.delete_agent(agent.id()).await.unwrap();
        assert!(registry.get(agent.id()).await.unwrap().is_none());
        assert_eq!(manager.agent_count(), 0);
    }

    #[tokio::test]
    async fn test_restores_persisted_agents_as_stopped() {
        let registry = Arc::new(InMemoryRegistry::new());
        let running = Agent::new("was-running", "worker", agent_config());
        running.set_state(AgentState::Running);
        let created = Agent::new("was-created", "worker", agent_config());
        registry.create(&running.to_record()).await.unwrap();
        registry.create(&created.to_record()).await.unwrap();

        let manager = RuntimeManager::builder(config(10))
            .registry(registry.clone())
            .build()
            .await;

        assert_eq!(manager.agent_count(), 2);
        let restored = manager.get_agent(running.id()).await.unwrap();
        assert_eq!(restored.state(), AgentState::Stopped);
        assert_eq!(
            manager.get_agent(created.id()).await.unwrap().state(),
            AgentState::Created
        );
        assert_eq!(manager.metrics().current_active_agents, 1);

        // a stopped agent can be brought back with restart
        manager.restart_agent(running.id()).await.unwrap();
        assert_eq!(restored.state(), AgentState::Running);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_agent_falls_back_to_registry() {
        let registry = Arc::new(InMemoryRegistry::new());
        let manager = RuntimeManager::builder(config(10))
            .registry(registry.clone())
            .build()
            .await;

        let late = Agent::new("late", "worker", agent_config());
        registry.create(&late.to_record()).await.unwrap();

        let fetched = manager.get_agent(late.id()).await.unwrap();
        assert_eq!(fetched.name(), "late");
        assert_eq!(manager.agent_count(), 1);
        assert!(matches!(
            manager.get_agent("missing").await,
            Err(RuntimeError::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_restored_agents_respect_limit() {
        let registry = Arc::new(InMemoryRegistry::new());
        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            let agent = Agent::new(name, "worker", agent_config());
            registry.create(&agent.to_record()).await.unwrap();
            ids.push(agent.id().to_string());
        }

        let manager = RuntimeManager::builder(config(2))
            .registry(registry.clone())
            .build()
            .await;
        assert_eq!(manager.agent_count(), 2);
        assert_eq!(manager.metrics().current_active_agents, 2);

        let uncached = ids
            .iter()
            .find(|id| manager.cached(id.as_str()).is_err())
            .expect("one agent left uncached")
            .clone();
        assert!(matches!(
            manager.get_agent(&uncached).await,
            Err(RuntimeError::AgentLimitReached { max: 2 })
        ));
        assert_eq!(manager.agent_count(), 2);

        // freeing a slot lets the lookup through
        let evicted = ids.iter().find(|id| **id != uncached).expect("a cached agent");
        manager.delete_agent(evicted).await.unwrap();
        let fetched = manager.get_agent(&uncached).await.unwrap();
        assert_eq!(fetched.state(), AgentState::Created);
        assert_eq!(manager.agent_count(), 2);
        assert_eq!(manager.metrics().current_active_agents, 2);
    }

    /// Registry whose writes can be switched off
    #[derive(Default)]
    struct FlakyRegistry {
        inner: InMemoryRegistry,
        fail_create: bool,
        fail_update: bool,
    }

    #[async_trait]
    impl AgentRegistry for FlakyRegistry {
        async fn create(&self, record: &AgentRecord) -> Result<()> {
            if self.fail_create {
                return Err(RuntimeError::Registry("disk full".into()));
            }
            self.inner.create(record).await
        }

        async fn get(&self, id: &str) -> Result<Option<AgentRecord>> {
            self.inner.get(id).await
        }

        async fn list(&self) -> Result<Vec<AgentRecord>> {
            self.inner.list().await
        }

        async fn update(&self, record: &AgentRecord) -> Result<()> {
            if self.fail_update {
                return Err(RuntimeError::Registry("disk full".into()));
            }
            self.inner.update(record).await
        }

        async fn delete(&self, id: &str) -> Result<()> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn test_registry_create_failure_is_fatal() {
        let registry = Arc::new(FlakyRegistry {
            fail_create: true,
            ..Default::default()
        });
        let manager = RuntimeManager::builder(config(1))
            .registry(registry)
            .build()
            .await;

        assert!(matches!(
            manager.create_agent("a", "worker", agent_config()).await,
            Err(RuntimeError::Registry(_))
        ));
        assert_eq!(manager.agent_count(), 0);
        assert_eq!(manager.metrics().total_agents_created, 0);
    }

    #[tokio::test]
    async fn test_registry_update_failure_is_tolerated() {
        let registry = Arc::new(FlakyRegistry {
            fail_update: true,
            ..Default::default()
        });
        let manager = RuntimeManager::builder(config(10))
            .registry(registry)
            .build()
            .await;

        let agent = manager.create_agent("a", "worker", agent_config()).await.unwrap();
        manager.start_agent(agent.id()).await.unwrap();
        manager.stop_agent(agent.id()).await.unwrap();
        assert_eq!(agent.state(), AgentState::Stopped);
    }

    #[tokio::test]
    async fn test_health_scan_reports_stale_agents() {
        let manager = RuntimeManager::new(config(10));
        let agent = manager
            .create_agent(
                "a",
                "worker",
                AgentConfig {
                    heartbeat_interval: Duration::from_millis(10),
                    ..agent_config()
                },
            )
            .await
            .unwrap();

        // live but never ticking
        agent.set_state(AgentState::Running);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(manager.check_agent_health(), vec![agent.id().to_string()]);

        agent.set_state(AgentState::Stopped);
        assert!(manager.check_agent_health().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let manager = RuntimeManager::new(config(10));
        let a = manager.create_agent("a", "worker", agent_config()).await.unwrap();
        let b = manager.create_agent("b", "worker", agent_config()).await.unwrap();
        manager.start_agent(a.id()).await.unwrap();
        manager.start_agent(b.id()).await.unwrap();

        manager.shutdown().await.unwrap();
        assert_eq!(a.state(), AgentState::Stopped);
        assert_eq!(b.state(), AgentState::Stopped);
        assert!(manager.is_shutting_down());
        assert!(matches!(
            manager.create_agent("c", "worker", agent_config()).await,
            Err(RuntimeError::ShuttingDown)
        ));
    }
}
