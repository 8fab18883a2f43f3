// src/orchestration/load.rs
//! Per-agent load snapshots and health scoring

use crate::runtime::agent::Agent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Coordinator's view of one agent's load
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentLoad {
    pub agent_id: String,
    pub active_tasks: usize,
    /// Queued tasks plus outstanding assignment permits
    pub queued_tasks: usize,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    /// In `[0, 1]`
    pub health_score: f64,
    pub capabilities: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

impl AgentLoad {
    /// Default snapshot for an agent the coordinator has not sampled yet
    pub fn idle(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            active_tasks: 0,
            queued_tasks: 0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            health_score: 1.0,
            capabilities: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Sample `agent`; `reserved` counts outstanding assignment permits
    pub fn observe(agent: &Agent, usage: Option<ResourceUsage>, reserved: usize) -> Self {
        let usage = usage.unwrap_or_default();
        Self {
            agent_id: agent.id().to_string(),
            active_tasks: agent.active_tasks(),
            queued_tasks: agent.queued_tasks() + reserved,
            cpu_usage: usage.cpu_percent,
            memory_usage: usage.memory_percent,
            health_score: health_score(
                agent.heartbeat_age(),
                agent.config().heartbeat_interval,
                agent.completed_tasks(),
                agent.failed_tasks(),
            ),
            capabilities: agent.config().capabilities.clone(),
            last_updated: Utc::now(),
        }
    }

    pub fn total(&self) -> usize {
        self.active_tasks + self.queued_tasks
    }
}

/// Heartbeat freshness weighted by task reliability
///
/// Freshness is 1 while the heartbeat is at most one interval old and falls
/// linearly to 0 at two intervals. Reliability is `1 - 0.5 * failure_ratio`.
pub fn health_score(heartbeat_age: Duration, interval: Duration, completed: u64, failed: u64) -> f64 {
    let interval = interval.as_secs_f64();
    let age = heartbeat_age.as_secs_f64();

    let freshness = if interval <= 0.0 || age <= interval {
        1.0
    } else {
        (2.0 - age / interval).clamp(0.0, 1.0)
    };

    let finished = completed + failed;
    let reliability = if finished == 0 {
        1.0
    } else {
        1.0 - 0.5 * (failed as f64 / finished as f64)
    };

    (freshness * reliability).clamp(0.0, 1.0)
}

/// Resource usage sample, both values in percent
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Source of CPU and memory samples for agents
pub trait ResourceProbe: Send + Sync {
    fn sample(&self, agent: &Agent) -> Option<ResourceUsage>;
}

/// Probe that never reports usage
pub struct NoopProbe;

impl ResourceProbe for NoopProbe {
    fn sample(&self, _agent: &Agent) -> Option<ResourceUsage> {
        None
    }
}
