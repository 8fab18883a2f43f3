// src/orchestration/selection.rs
//! Selection strategies
//!
//! The ranking functions work on plain [`Candidate`] snapshots and return
//! indices into the candidate slice, so they are easy to test and bench in
//! isolation. Candidates are always passed in ID order; every ranking is
//! stable, so ties keep that order.

use crate::utils::errors::RuntimeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    #[default]
    LeastLoaded,
    HealthAware,
    Specific,
    CapabilityBased,
}

impl SelectionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::LeastLoaded => "least_loaded",
            SelectionStrategy::HealthAware => "health_aware",
            SelectionStrategy::Specific => "specific",
            SelectionStrategy::CapabilityBased => "capability_based",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStrategy {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(SelectionStrategy::RoundRobin),
            "least_loaded" => Ok(SelectionStrategy::LeastLoaded),
            "health_aware" => Ok(SelectionStrategy::HealthAware),
            "specific" => Ok(SelectionStrategy::Specific),
            "capability_based" => Ok(SelectionStrategy::CapabilityBased),
            other => Err(RuntimeError::InvalidConfig(format!(
                "unknown selection strategy '{}'",
                other
            ))),
        }
    }
}

/// Criteria for choosing agents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSelector {
    pub strategy: SelectionStrategy,
    /// Allowlist of agent IDs; empty means any
    pub specific_agents: Vec<String>,
    pub required_capabilities: Vec<String>,
    pub pool_id: Option<String>,
    /// Every tag must match the agent's metadata
    pub tags: BTreeMap<String, String>,
    /// Minimum health score; 0 disables the filter
    pub health_threshold: f64,
}

impl AgentSelector {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn with_agents<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.specific_agents = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn require(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    pub fn in_pool(mut self, pool_id: impl Into<String>) -> Self {
        self.pool_id = Some(pool_id.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn min_health(mut self, threshold: f64) -> Self {
        self.health_threshold = threshold;
        self
    }

    /// Key under which round-robin position is tracked
    pub fn rotation_key(&self) -> &str {
        self.pool_id.as_deref().unwrap_or("default")
    }
}

/// Load and health of one eligible agent
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub agent_id: String,
    pub load: usize,
    pub health_score: f64,
}

/// First `count` candidates in order
pub fn take_first(len: usize, count: usize) -> Vec<usize> {
    (0..count.min(len)).collect()
}

/// `count` consecutive positions starting at `start`, wrapping around
pub fn rotate(len: usize, start: usize, count: usize) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }
    (0..count.min(len)).map(|i| (start + i) % len).collect()
}

/// Lowest total load first
pub fn rank_least_loaded(candidates: &[Candidate], count: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by_key(|&i| candidates[i].load);
    order.truncate(count);
    order
}

/// Highest health score first
pub fn rank_health_aware(candidates: &[Candidate], count: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| {
        candidates[b]
            .health_score
            .total_cmp(&candidates[a].health_score)
    });
    order.truncate(count);
    order
}
