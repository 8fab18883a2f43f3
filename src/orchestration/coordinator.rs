// src/orchestration/coordinator.rs
//! Agent coordinator: load-aware selection and task assignment
//!
//! The coordinator sits beside the [`RuntimeManager`] and talks to it only
//! through `list_agents` and `get_agent`. It keeps a load snapshot per
//! agent, refreshed periodically from the agents' real counters, and uses
//! it to pick agents for work and to refuse assignments to overloaded or
//! unhealthy agents.

use crate::orchestration::lease::{release_reservation, AssignmentPermit, LeaseLedger};
use crate::orchestration::load::{AgentLoad, NoopProbe, ResourceProbe};
use crate::orchestration::selection::{
    rank_health_aware, rank_least_loaded, rotate, take_first, AgentSelector, Candidate,
    SelectionStrategy,
};
use crate::runtime::agent::{Agent, AgentState};
use crate::runtime::manager::RuntimeManager;
use crate::runtime::task::Task;
use crate::utils::config::duration_ms;
use crate::utils::errors::{Result, RuntimeError};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Configuration for the agent coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Period of the load refresh loop (default: 30s)
    #[serde(rename = "load_update_interval_ms", with = "duration_ms")]
    pub load_update_interval: Duration,

    /// Minimum health score for assignment (default: 0.7)
    pub health_threshold: f64,

    /// Active plus queued tasks at which an agent is overloaded (default: 10)
    pub max_tasks_per_agent: usize,

    /// Strategy used by [`AgentCoordinator::default_selector`]
    pub strategy: SelectionStrategy,

    /// Refuse assignments to agents below `health_threshold`
    pub enable_health_aware_selection: bool,

    /// Apply `required_capabilities` when filtering candidates
    pub capability_matching: bool,

    /// How long an unredeemed permit holds its slot (default: 30s)
    #[serde(rename = "lease_ttl_ms", with = "duration_ms")]
    pub lease_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            load_update_interval: Duration::from_secs(30),
            health_threshold: 0.7,
            max_tasks_per_agent: 10,
            strategy: SelectionStrategy::LeastLoaded,
            enable_health_aware_selection: true,
            capability_matching: true,
            lease_ttl: Duration::from_secs(30),
        }
    }
}

/// One agent's deviation from the mean load
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadImbalance {
    pub agent_id: String,
    pub current_load: usize,
    pub target_load: usize,
}

/// Advisory output of [`AgentCoordinator::rebalance_load`]
///
/// Nothing is moved; callers decide what to do with the plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebalancePlan {
    pub total_tasks: usize,
    pub target_load: usize,
    pub overloaded: Vec<LoadImbalance>,
    pub underloaded: Vec<LoadImbalance>,
}

impl RebalancePlan {
    pub fn is_balanced(&self) -> bool {
        self.overloaded.is_empty() && self.underloaded.is_empty()
    }
}

pub struct AgentCoordinator {
    config: CoordinatorConfig,
    manager: Arc<RuntimeManager>,
    loads: Arc<DashMap<String, AgentLoad>>,
    /// Next round-robin position per pool (or "default")
    round_robin: Mutex<HashMap<String, usize>>,
    leases: Arc<LeaseLedger>,
    probe: Arc<dyn ResourceProbe>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl AgentCoordinator {
    pub fn new(config: CoordinatorConfig, manager: Arc<RuntimeManager>) -> Arc<Self> {
        Self::with_probe(config, manager, Arc::new(NoopProbe))
    }

    pub fn with_probe(
        config: CoordinatorConfig,
        manager: Arc<RuntimeManager>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            manager,
            loads: Arc::new(DashMap::new()),
            round_robin: Mutex::new(HashMap::new()),
            leases: Arc::new(LeaseLedger::default()),
            probe,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Selector using the configured strategy and health threshold
    pub fn default_selector(&self) -> AgentSelector {
        let threshold = if self.config.enable_health_aware_selection {
            self.config.health_threshold
        } else {
            0.0
        };
        AgentSelector::new(self.config.strategy).min_health(threshold)
    }

    /// Start the periodic load refresh
    pub fn start(self: &Arc<Self>) {
        let coordinator: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.load_update_interval;

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(coordinator) = coordinator.upgrade() else { break };
                        coordinator.refresh_loads();
                    }
                }
            }
            debug!("Load refresh loop exited");
        });

        info!(
            "Agent coordinator started (strategy: {}, refresh every {:?})",
            self.config.strategy, period
        );
    }

    /// Stop the refresh loop and wait for it to exit
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Agent coordinator stopped");
    }

    /// Running agents ordered by ID
    pub fn available_agents(&self) -> Vec<Arc<Agent>> {
        self.manager
            .list_agents()
            .into_iter()
            .filter(|agent| agent.state() == AgentState::Running)
            .collect()
    }

    /// Current load snapshot, created on first query
    pub async fn agent_load(&self, agent_id: &str) -> AgentLoad {
        if let Some(load) = self.loads.get(agent_id) {
            return load.clone();
        }

        let snapshot = match self.manager.get_agent(agent_id).await {
            Ok(agent) => self.observe(&agent),
            Err(_) => AgentLoad::idle(agent_id),
        };

        self.loads
            .entry(agent_id.to_string())
            .or_insert(snapshot)
            .clone()
    }

    /// Choose up to `count` running agents matching `selector`
    pub async fn select_agents(
        &self,
        selector: &AgentSelector,
        count: usize,
    ) -> Result<Vec<Arc<Agent>>> {
        let available = self.available_agents();
        if available.is_empty() {
            return Err(RuntimeError::NoAgentsAvailable);
        }

        let mut eligible = Vec::new();
        let mut candidates = Vec::new();
        for agent in available {
            let load = self.agent_load(agent.id()).await;
            if self.matches(&agent, &load, selector) {
                candidates.push(Candidate {
                    agent_id: agent.id().to_string(),
                    load: load.total(),
                    health_score: load.health_score,
                });
                eligible.push(agent);
            }
        }

        if eligible.is_empty() {
            return Err(RuntimeError::NoMatchingAgents);
        }
        if count == 0 {
            return Ok(Vec::new());
        }

        let picks = match selector.strategy {
            SelectionStrategy::RoundRobin => self.next_rotation(selector, eligible.len(), count),
            SelectionStrategy::LeastLoaded => rank_least_loaded(&candidates, count),
            SelectionStrategy::HealthAware => rank_health_aware(&candidates, count),
            SelectionStrategy::Specific | SelectionStrategy::CapabilityBased => {
                take_first(eligible.len(), count)
            }
        };

        let selected: Vec<Arc<Agent>> = picks
            .into_iter()
            .map(|i| Arc::clone(&eligible[i]))
            .collect();

        debug!(
            "Selected {} of {} eligible agents using {}",
            selected.len(),
            eligible.len(),
            selector.strategy
        );
        Ok(selected)
    }

    fn matches(&self, agent: &Agent, load: &AgentLoad, selector: &AgentSelector) -> bool {
        if !selector.specific_agents.is_empty()
            && !selector.specific_agents.iter().any(|id| id == agent.id())
        {
            return false;
        }

        if let Some(pool) = &selector.pool_id {
            if agent.config().pool.as_deref() != Some(pool.as_str()) {
                return false;
            }
        }

        if self.config.capability_matching
            && !selector
                .required_capabilities
                .iter()
                .all(|capability| agent.config().has_capability(capability))
        {
            return false;
        }

        if self.config.enable_health_aware_selection
            && selector.health_threshold > 0.0
            && load.health_score < selector.health_threshold
        {
            return false;
        }

        if !selector.tags.is_empty() {
            let metadata = agent.metadata();
            if !selector
                .tags
                .iter()
                .all(|(key, value)| metadata.get(key) == Some(value))
            {
                return false;
            }
        }

        true
    }

    fn next_rotation(&self, selector: &AgentSelector, len: usize, count: usize) -> Vec<usize> {
        let mut positions = self.round_robin.lock();
        let position = positions
            .entry(selector.rotation_key().to_string())
            .or_insert(0);
        let start = *position % len;
        let picks = rotate(len, start, count);
        *position = (start + picks.len()) % len;
        picks
    }

    /// Reserve a slot for `task` on `agent_id`
    ///
    /// Rejects overloaded agents, and unhealthy ones when health-aware
    /// selection is on, without touching the load snapshot. The returned
    /// permit must be redeemed against the agent to actually submit.
    pub async fn assign_task(
        &self,
        agent_id: &str,
        task: Task,
        execution: Option<&str>,
    ) -> Result<AssignmentPermit> {
        self.manager.get_agent(agent_id).await?;
        self.agent_load(agent_id).await;

        {
            let mut load = self
                .loads
                .entry(agent_id.to_string())
                .or_insert_with(|| AgentLoad::idle(agent_id));

            let current = load.total();
            if current >= self.config.max_tasks_per_agent {
                return Err(RuntimeError::AgentOverloaded {
                    agent_id: agent_id.to_string(),
                    load: current,
                    max: self.config.max_tasks_per_agent,
                });
            }

            if self.config.enable_health_aware_selection
                && load.health_score < self.config.health_threshold
            {
                return Err(RuntimeError::AgentUnhealthy {
                    agent_id: agent_id.to_string(),
                    score: load.health_score,
                    threshold: self.config.health_threshold,
                });
            }

            load.queued_tasks += 1;
            load.last_updated = chrono::Utc::now();
        }

        let (lease_id, expires_at) = self
            .leases
            .grant(agent_id, &task.id, self.config.lease_ttl);

        info!(
            "Assigned task {} to agent {} (execution: {})",
            task.id,
            agent_id,
            execution.unwrap_or("-")
        );

        Ok(AssignmentPermit::new(
            lease_id,
            agent_id.to_string(),
            task,
            expires_at,
            Arc::clone(&self.leases),
            Arc::clone(&self.loads),
        ))
    }

    /// Flag running agents whose load strays more than one task from the mean
    pub async fn rebalance_load(&self) -> Result<RebalancePlan> {
        let agents = self.available_agents();
        if agents.len() < 2 {
            return Ok(RebalancePlan::default());
        }

        let mut loads = Vec::with_capacity(agents.len());
        for agent in &agents {
            let load = self.agent_load(agent.id()).await;
            loads.push((agent.id().to_string(), load.total()));
        }

        let total_tasks: usize = loads.iter().map(|(_, load)| load).sum();
        if total_tasks == 0 {
            return Ok(RebalancePlan::default());
        }

        let target_load = total_tasks / loads.len();
        let mut plan = RebalancePlan {
            total_tasks,
            target_load,
            ..Default::default()
        };

        for (agent_id, current_load) in loads {
            let imbalance = LoadImbalance {
                agent_id,
                current_load,
                target_load,
            };
            if current_load > target_load + 1 {
                plan.overloaded.push(imbalance);
            } else if current_load + 1 < target_load {
                plan.underloaded.push(imbalance);
            }
        }

        if !plan.is_balanced() {
            info!(
                "Load imbalance: {} overloaded, {} underloaded (target {} tasks per agent)",
                plan.overloaded.len(),
                plan.underloaded.len(),
                target_load
            );
        }
        Ok(plan)
    }

    /// Resample every running agent and sweep expired leases
    ///
    /// Returns the number of agents refreshed.
    pub fn refresh_loads(&self) -> usize {
        for lease in self.leases.sweep_expired(Instant::now()) {
            warn!(
                "Assignment of task {} to agent {} expired unredeemed",
                lease.task_id, lease.agent_id
            );
            release_reservation(&self.loads, &lease.agent_id);
        }

        let known: HashSet<String> = self
            .manager
            .list_agents()
            .iter()
            .map(|agent| agent.id().to_string())
            .collect();
        self.loads.retain(|agent_id, _| known.contains(agent_id));

        let running = self.available_agents();
        for agent in &running {
            self.loads
                .insert(agent.id().to_string(), self.observe(agent));
        }

        debug!("Refreshed load for {} agents", running.len());
        running.len()
    }

    /// Permits granted and not yet redeemed, dropped or swept
    pub fn outstanding_permits(&self) -> usize {
        self.leases.len()
    }

    fn observe(&self, agent: &Agent) -> AgentLoad {
        AgentLoad::observe(
            agent,
            self.probe.sample(agent),
            self.leases.outstanding_for(agent.id()),
        )
    }
}

impl Drop for AgentCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
