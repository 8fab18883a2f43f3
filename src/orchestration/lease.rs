// src/orchestration/lease.rs
//! Assignment permits
//!
//! `assign_task` reserves a slot in the target agent's load and hands back
//! an [`AssignmentPermit`]. The reservation counts as queued load until the
//! permit is redeemed (the task is submitted), dropped, or its lease
//! expires and is swept by the coordinator's refresh loop.

use crate::orchestration::load::AgentLoad;
use crate::runtime::agent::Agent;
use crate::runtime::task::Task;
use crate::utils::errors::{Result, RuntimeError};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub(crate) struct Lease {
    pub agent_id: String,
    pub task_id: String,
    pub expires_at: Instant,
}

/// Outstanding leases, keyed by lease ID
#[derive(Default)]
pub(crate) struct LeaseLedger {
    leases: DashMap<u64, Lease>,
    next_id: AtomicU64,
}

impl LeaseLedger {
    pub fn grant(&self, agent_id: &str, task_id: &str, ttl: Duration) -> (u64, Instant) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let expires_at = Instant::now() + ttl;
        self.leases.insert(
            id,
            Lease {
                agent_id: agent_id.to_string(),
                task_id: task_id.to_string(),
                expires_at,
            },
        );
        (id, expires_at)
    }

    /// Remove a lease; `None` when it was already released or swept
    pub fn release(&self, lease_id: u64) -> Option<Lease> {
        self.leases.remove(&lease_id).map(|(_, lease)| lease)
    }

    pub fn outstanding_for(&self, agent_id: &str) -> usize {
        self.leases
            .iter()
            .filter(|entry| entry.value().agent_id == agent_id)
            .count()
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    /// Remove and return every lease past its deadline
    pub fn sweep_expired(&self, now: Instant) -> Vec<Lease> {
        let expired: Vec<u64> = self
            .leases
            .iter()
            .filter(|entry| entry.value().expires_at <= now)
            .map(|entry| *entry.key())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.release(id))
            .collect()
    }
}

/// Give back one reserved slot in a load snapshot
pub(crate) fn release_reservation(loads: &DashMap<String, AgentLoad>, agent_id: &str) {
    if let Some(mut load) = loads.get_mut(agent_id) {
        load.queued_tasks = load.queued_tasks.saturating_sub(1);
        load.last_updated = Utc::now();
    }
}

/// A reserved slot on one agent for one task
pub struct AssignmentPermit {
    lease_id: u64,
    agent_id: String,
    task: Option<Task>,
    expires_at: Instant,
    ledger: Arc<LeaseLedger>,
    loads: Arc<DashMap<String, AgentLoad>>,
}

impl AssignmentPermit {
    pub(crate) fn new(
        lease_id: u64,
        agent_id: String,
        task: Task,
        expires_at: Instant,
        ledger: Arc<LeaseLedger>,
        loads: Arc<DashMap<String, AgentLoad>>,
    ) -> Self {
        Self {
            lease_id,
            agent_id,
            task: Some(task),
            expires_at,
            ledger,
            loads,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn task(&self) -> Option<&Task> {
        self.task.as_ref()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Submit the task to `agent`, consuming the permit
    ///
    /// On success the reservation turns into a real queued task. On any
    /// failure the reservation is released.
    pub fn redeem(mut self, agent: &Agent) -> Result<()> {
        if agent.id() != self.agent_id {
            return Err(RuntimeError::PermitMismatch {
                expected: self.agent_id.clone(),
                actual: agent.id().to_string(),
            });
        }

        let Some(task) = self.task.take() else {
            return Err(RuntimeError::LeaseExpired(self.agent_id.clone()));
        };

        // Already swept by the refresh loop; its slot was given back there
        if self.ledger.release(self.lease_id).is_none() {
            return Err(RuntimeError::LeaseExpired(self.agent_id.clone()));
        }

        if Instant::now() >= self.expires_at {
            release_reservation(&self.loads, &self.agent_id);
            return Err(RuntimeError::LeaseExpired(self.agent_id.clone()));
        }

        let task_id = task.id.clone();
        match agent.submit_task(task) {
            Ok(()) => {
                debug!("Permit redeemed: task {} queued on agent {}", task_id, self.agent_id);
                Ok(())
            }
            Err(e) => {
                release_reservation(&self.loads, &self.agent_id);
                Err(e)
            }
        }
    }
}

impl Drop for AssignmentPermit {
    fn drop(&mut self) {
        if self.task.is_none() {
            return;
        }
        if self.ledger.release(self.lease_id).is_some() {
            release_reservation(&self.loads, &self.agent_id);
            debug!("Permit for agent {} dropped unredeemed", self.agent_id);
        }
    }
}

impl std::fmt::Debug for AssignmentPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssignmentPermit")
            .field("lease_id", &self.lease_id)
            .field("agent_id", &self.agent_id)
            .field("task_id", &self.task.as_ref().map(|t| t.id.as_str()))
            .finish()
    }
}
