// src/runtime/agent.rs
//! Agent: identity, lifecycle state, bounded task queue and liveness
//!
//! An agent owns everything its workers need: the task queue, the
//! cancellation token shared by its worker pool, the pause signal and the
//! error channel its supervisor drains. All accessors take `&self` and are
//! safe to call from any thread.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──► Running ◄──► Paused
//!    │           │           │
//!    └──────► Stopped ◄──────┘
//!                │
//!   Running/Paused ──► Failed
//! ```

use crate::registry::AgentRecord;
use crate::runtime::extensions::{
    AgentExtensions, MemoryService, MessagingService, TaskManagerService,
};
use crate::runtime::task::Task;
use crate::runtime::task_queue::TaskQueue;
use crate::utils::config::duration_ms;
use crate::utils::errors::{Result, RuntimeError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::warn;

const DEFAULT_MAX_CONCURRENT_TASKS: usize = 5;
const DEFAULT_TASK_QUEUE_SIZE: usize = 100;
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);
const ERROR_CHANNEL_CAPACITY: usize = 10;

/// Agent lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Created,
    Running,
    Paused,
    Stopped,
    Failed,
}

impl AgentState {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Created => "created",
            AgentState::Running => "running",
            AgentState::Paused => "paused",
            AgentState::Stopped => "stopped",
            AgentState::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Stopped)
                | (Running, Paused)
                | (Running, Stopped)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Stopped)
                | (Paused, Failed)
        )
    }

    /// Running or Paused: the agent has a live worker pool
    pub fn is_live(self) -> bool {
        matches!(self, AgentState::Running | AgentState::Paused)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentState {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(AgentState::Created),
            "running" => Ok(AgentState::Running),
            "paused" => Ok(AgentState::Paused),
            "stopped" => Ok(AgentState::Stopped),
            "failed" => Ok(AgentState::Failed),
            other => Err(RuntimeError::Registry(format!(
                "unknown agent state '{}'",
                other
            ))),
        }
    }
}

/// Advisory resource hints for an agent (not enforced by the runtime)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceHints {
    /// CPU request in millicores. Example: 500 = half a core
    pub cpu_millicores: Option<u32>,

    /// Memory request in megabytes
    pub memory_mb: Option<u64>,

    /// Upper bound on queued tasks; tightens `task_queue_size` when smaller
    pub max_queued_tasks: Option<usize>,
}

impl Default for ResourceHints {
    fn default() -> Self {
        Self {
            cpu_millicores: Some(100),
            memory_mb: Some(128),
            max_queued_tasks: None,
        }
    }
}

impl ResourceHints {
    pub fn unbounded() -> Self {
        Self {
            cpu_millicores: None,
            memory_mb: None,
            max_queued_tasks: None,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if let Some(cpu) = self.cpu_millicores {
            if cpu == 0 {
                return Err("CPU hint cannot be 0".to_string());
            }
            if cpu > 64_000 {
                return Err("CPU hint cannot exceed 64 cores (64000 millicores)".to_string());
            }
        }

        if let Some(memory) = self.memory_mb {
            if memory == 0 {
                return Err("Memory hint cannot be 0".to_string());
            }
            if memory > 1_048_576 {
                return Err("Memory hint cannot exceed 1TB".to_string());
            }
        }

        if self.max_queued_tasks == Some(0) {
            return Err("max_queued_tasks cannot be 0".to_string());
        }

        Ok(())
    }
}

/// Agent configuration; zero values fall back to defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Number of worker tasks draining the queue (default: 5)
    pub max_concurrent_tasks: usize,

    /// Bounded queue capacity (default: 100)
    pub task_queue_size: usize,

    /// Liveness tick period (default: 30s)
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Per-task timeout unless the task overrides it (default: 5m)
    #[serde(rename = "task_timeout_ms", with = "duration_ms")]
    pub task_timeout: Duration,

    pub resources: ResourceHints,

    /// Capability names used by capability-based selection
    pub capabilities: Vec<String>,

    /// Pool the agent belongs to, if any
    pub pool: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            task_queue_size: DEFAULT_TASK_QUEUE_SIZE,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            resources: ResourceHints::default(),
            capabilities: Vec::new(),
            pool: None,
        }
    }
}

impl AgentConfig {
    /// Replace zero values with defaults
    pub fn normalized(mut self) -> Self {
        if self.max_concurrent_tasks == 0 {
            self.max_concurrent_tasks = DEFAULT_MAX_CONCURRENT_TASKS;
        }
        if self.task_queue_size == 0 {
            self.task_queue_size = DEFAULT_TASK_QUEUE_SIZE;
        }
        if self.heartbeat_interval.is_zero() {
            self.heartbeat_interval = DEFAULT_HEARTBEAT_INTERVAL;
        }
        if self.task_timeout.is_zero() {
            self.task_timeout = DEFAULT_TASK_TIMEOUT;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.resources.validate().map_err(RuntimeError::InvalidConfig)?;

        if self.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(RuntimeError::InvalidConfig(
                "capability names cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    fn queue_capacity(&self) -> usize {
        match self.resources.max_queued_tasks {
            Some(limit) => limit.min(self.task_queue_size),
            None => self.task_queue_size,
        }
    }
}

/// Non-task failure reported on an agent's error channel
#[derive(Debug, Clone)]
pub struct AgentFault {
    pub message: String,
    pub task_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl AgentFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            task_id: None,
            at: Utc::now(),
        }
    }

    pub fn for_task(message: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Self::new(message)
        }
    }
}

struct AgentStatus {
    state: AgentState,
    updated_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    /// Monotonic twin of `last_heartbeat` used for liveness math
    heartbeat_clock: Instant,
}

/// A supervised agent
pub struct Agent {
    id: String,
    name: String,
    agent_type: String,
    config: AgentConfig,
    created_at: DateTime<Utc>,

    status: RwLock<AgentStatus>,
    metadata: RwLock<HashMap<String, String>>,

    /// Shared by the worker pool; replaced on restart
    cancel: RwLock<CancellationToken>,

    queue: TaskQueue,
    paused: watch::Sender<bool>,

    active_tasks: AtomicUsize,
    completed_tasks: AtomicU64,
    failed_tasks: AtomicU64,

    fault_tx: mpsc::Sender<AgentFault>,
    fault_rx: AsyncMutex<mpsc::Receiver<AgentFault>>,

    /// Serializes start, stop, restart and delete
    lifecycle: AsyncMutex<()>,

    extensions: AgentExtensions,
}

impl Agent {
    /// Create an agent with its own root cancellation token
    pub fn new(name: impl Into<String>, agent_type: impl Into<String>, config: AgentConfig) -> Self {
        Self::build(
            ulid::Ulid::new().to_string(),
            name.into(),
            agent_type.into(),
            config,
            CancellationToken::new(),
            Utc::now(),
            AgentState::Created,
            HashMap::new(),
        )
    }

    /// Create an agent whose token is a child of `parent`
    pub fn with_parent(
        name: impl Into<String>,
        agent_type: impl Into<String>,
        config: AgentConfig,
        parent: &CancellationToken,
    ) -> Self {
        Self::build(
            ulid::Ulid::new().to_string(),
            name.into(),
            agent_type.into(),
            config,
            parent.child_token(),
            Utc::now(),
            AgentState::Created,
            HashMap::new(),
        )
    }

    /// Rebuild an agent from its persisted record in the given state
    pub fn from_record(record: AgentRecord, state: AgentState, parent: &CancellationToken) -> Self {
        let agent = Self::build(
            record.id,
            record.name,
            record.agent_type,
            record.config,
            parent.child_token(),
            record.created_at,
            state,
            record.metadata,
        );
        agent.status.write().updated_at = record.updated_at;
        agent
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        id: String,
        name: String,
        agent_type: String,
        config: AgentConfig,
        cancel: CancellationToken,
        created_at: DateTime<Utc>,
        state: AgentState,
        metadata: HashMap<String, String>,
    ) -> Self {
        let config = config.normalized();
        let (fault_tx, fault_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let (paused, _) = watch::channel(false);
        let now = Utc::now();

        Self {
            id,
            name,
            agent_type,
            queue: TaskQueue::new(config.queue_capacity()),
            config,
            created_at,
            status: RwLock::new(AgentStatus {
                state,
                updated_at: now,
                last_heartbeat: now,
                heartbeat_clock: Instant::now(),
            }),
            metadata: RwLock::new(metadata),
            cancel: RwLock::new(cancel),
            paused,
            active_tasks: AtomicUsize::new(0),
            completed_tasks: AtomicU64::new(0),
            failed_tasks: AtomicU64::new(0),
            fault_tx,
            fault_rx: AsyncMutex::new(fault_rx),
            lifecycle: AsyncMutex::new(()),
            extensions: AgentExtensions::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> AgentState {
        self.status.read().state
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.status.read().updated_at
    }

    /// Unconditional state write; `updated_at` never moves backwards
    pub fn set_state(&self, state: AgentState) {
        let mut status = self.status.write();
        status.state = state;
        touch(&mut status);
    }

    /// Validated transition; returns the previous state
    pub fn transition(&self, to: AgentState) -> Result<AgentState> {
        let mut status = self.status.write();
        let from = status.state;
        if !from.can_transition_to(to) {
            return Err(RuntimeError::InvalidStateTransition {
                agent_id: self.id.clone(),
                from,
                to,
            });
        }
        status.state = to;
        touch(&mut status);
        Ok(from)
    }

    /// Transition only when the current state is exactly `expected`
    pub fn transition_from(&self, expected: AgentState, to: AgentState) -> Result<()> {
        let mut status = self.status.write();
        if status.state != expected || !expected.can_transition_to(to) {
            return Err(RuntimeError::InvalidStateTransition {
                agent_id: self.id.clone(),
                from: status.state,
                to,
            });
        }
        status.state = to;
        touch(&mut status);
        Ok(())
    }

    /// Cancel the worker pool and mark Stopped
    ///
    /// Returns the previous state, or `None` when already stopped or failed.
    /// A failed agent keeps its state; only its token is cancelled.
    pub fn stop(&self) -> Option<AgentState> {
        let previous = {
            let mut status = self.status.write();
            if status.state == AgentState::Stopped {
                return None;
            }
            if status.state == AgentState::Failed {
                drop(status);
                self.cancel();
                return None;
            }
            let previous = status.state;
            status.state = AgentState::Stopped;
            touch(&mut status);
            previous
        };
        self.cancel();
        Some(previous)
    }

    /// Record a liveness tick
    pub fn update_heartbeat(&self) {
        let mut status = self.status.write();
        status.last_heartbeat = Utc::now();
        status.heartbeat_clock = Instant::now();
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        self.status.read().last_heartbeat
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.status.read().heartbeat_clock.elapsed()
    }

    /// True while the last heartbeat is younger than two intervals
    pub fn is_healthy(&self) -> bool {
        self.heartbeat_age() < self.config.heartbeat_interval * 2
    }

    pub fn metadata(&self) -> HashMap<String, String> {
        self.metadata.read().clone()
    }

    pub fn metadata_value(&self, key: &str) -> Option<String> {
        self.metadata.read().get(key).cloned()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.write().insert(key.into(), value.into());
        touch(&mut self.status.write());
    }

    /// Enqueue a task without blocking
    pub fn submit_task(&self, task: Task) -> Result<()> {
        if self.is_cancelled() {
            return Err(RuntimeError::AgentStopped(self.id.clone()));
        }

        self.queue.push(task).map_err(|_| RuntimeError::QueueFull {
            agent_id: self.id.clone(),
            capacity: self.queue.capacity(),
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.read().clone()
    }

    pub fn cancel(&self) {
        self.cancel.read().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.read().is_cancelled()
    }

    /// Install a fresh token under `parent` once the old one is cancelled
    pub fn rearm(&self, parent: &CancellationToken) {
        let mut cancel = self.cancel.write();
        if cancel.is_cancelled() {
            *cancel = parent.child_token();
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.send_replace(paused);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn pause_signal(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn queued_tasks(&self) -> usize {
        self.queue.len()
    }

    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::Acquire)
    }

    pub fn completed_tasks(&self) -> u64 {
        self.completed_tasks.load(Ordering::Relaxed)
    }

    pub fn failed_tasks(&self) -> u64 {
        self.failed_tasks.load(Ordering::Relaxed)
    }

    /// Count a task as in flight until the guard is finished or dropped
    pub fn begin_task(&self) -> ActiveTaskGuard<'_> {
        self.active_tasks.fetch_add(1, Ordering::AcqRel);
        ActiveTaskGuard {
            agent: self,
            outcome: None,
        }
    }

    /// Report a non-task failure to the supervisor
    ///
    /// Returns false when the channel is full and the fault was dropped.
    pub fn report_fault(&self, fault: AgentFault) -> bool {
        match self.fault_tx.try_send(fault) {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping fault for agent {}: {}", self.id, e);
                false
            }
        }
    }

    /// Exclusive access to the error channel (held by the supervisor)
    pub async fn fault_receiver(&self) -> AsyncMutexGuard<'_, mpsc::Receiver<AgentFault>> {
        self.fault_rx.lock().await
    }

    pub(crate) async fn lifecycle_lock(&self) -> AsyncMutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }

    pub fn extensions(&self) -> &AgentExtensions {
        &self.extensions
    }

    pub fn setup_messaging(&self, service: Arc<dyn MessagingService>) {
        self.extensions.set_messaging(service);
    }

    pub async fn start_messaging(&self) -> Result<()> {
        let service = self.extensions.messaging()?;
        service.start(&self.id, self.cancellation_token()).await
    }

    pub async fn stop_messaging(&self) -> Result<()> {
        self.extensions.messaging()?.stop(&self.id).await
    }

    pub async fn send_message(&self, to: &str, payload: Bytes) -> Result<String> {
        self.extensions.messaging()?.send(&self.id, to, payload).await
    }

    pub fn setup_memory(&self, service: Arc<dyn MemoryService>) {
        self.extensions.set_memory(service);
    }

    pub async fn start_memory_sync(&self) -> Result<()> {
        let service = self.extensions.memory()?;
        service.start_sync(&self.id, self.cancellation_token()).await
    }

    pub async fn stop_memory_sync(&self) -> Result<()> {
        self.extensions.memory()?.stop_sync(&self.id).await
    }

    pub async fn remember(&self, key: &str, value: Bytes) -> Result<()> {
        self.extensions.memory()?.remember(&self.id, key, value).await
    }

    pub async fn recall(&self, key: &str) -> Result<Option<Bytes>> {
        self.extensions.memory()?.recall(&self.id, key).await
    }

    pub async fn forget(&self, key: &str) -> Result<()> {
        self.extensions.memory()?.forget(&self.id, key).await
    }

    pub fn setup_task_manager(&self, service: Arc<dyn TaskManagerService>) {
        self.extensions.set_task_manager(service);
    }

    pub async fn start_task_manager(&self) -> Result<()> {
        let service = self.extensions.task_manager()?;
        service.start(&self.id, self.cancellation_token()).await
    }

    pub async fn stop_task_manager(&self) -> Result<()> {
        self.extensions.task_manager()?.stop(&self.id).await
    }

    /// Snapshot for the registry
    pub fn to_record(&self) -> AgentRecord {
        let (state, updated_at) = {
            let status = self.status.read();
            (status.state, status.updated_at)
        };

        AgentRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            agent_type: self.agent_type.clone(),
            state,
            metadata: self.metadata(),
            config: self.config.clone(),
            is_healthy: self.is_healthy(),
            created_at: self.created_at,
            updated_at,
        }
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("agent_type", &self.agent_type)
            .field("state", &self.state())
            .field("queued_tasks", &self.queued_tasks())
            .field("active_tasks", &self.active_tasks())
            .finish()
    }
}

fn touch(status: &mut AgentStatus) {
    status.updated_at = status.updated_at.max(Utc::now());
}

/// Tracks one in-flight task on an [`Agent`]
pub struct ActiveTaskGuard<'a> {
    agent: &'a Agent,
    outcome: Option<bool>,
}

impl ActiveTaskGuard<'_> {
    pub fn finish(mut self, success: bool) {
        self.outcome = Some(success);
    }
}

impl Drop for ActiveTaskGuard<'_> {
    fn drop(&mut self) {
        match self.outcome {
            Some(true) => {
                self.agent.completed_tasks.fetch_add(1, Ordering::Relaxed);
            }
            Some(false) | None => {
                self.agent.failed_tasks.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.agent.active_tasks.fetch_sub(1, Ordering::AcqRel);
    }
}
