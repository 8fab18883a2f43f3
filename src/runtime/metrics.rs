// src/runtime/metrics.rs
//! Runtime counters
//!
//! [`MetricsRecorder`] keeps an in-process snapshot ([`RuntimeMetrics`]) and
//! mirrors every change to the `metrics` facade so a Prometheus exporter
//! installed by [`crate::observability::init_metrics`] can scrape them.

use parking_lot::RwLock;
use serde::Serialize;
use std::time::Duration;

pub const AGENTS_CREATED: &str = "cortex_agents_created_total";
pub const AGENTS_STOPPED: &str = "cortex_agents_stopped_total";
pub const TASKS_EXECUTED: &str = "cortex_tasks_executed_total";
pub const TASKS_FAILED: &str = "cortex_tasks_failed_total";
pub const TASKS_CANCELLED: &str = "cortex_tasks_cancelled_total";
pub const ACTIVE_AGENTS: &str = "cortex_active_agents";
pub const RUNNING_TASKS: &str = "cortex_running_tasks";
pub const TASK_DURATION: &str = "cortex_task_duration_seconds";

/// Point-in-time copy of the runtime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeMetrics {
    pub total_agents_created: u64,
    pub total_agents_stopped: u64,
    pub total_tasks_executed: u64,
    pub total_tasks_failed: u64,
    /// Queued tasks dropped because their agent stopped
    pub total_tasks_cancelled: u64,
    pub current_active_agents: u64,
    pub current_running_tasks: u64,
}

pub struct MetricsRecorder {
    inner: RwLock<RuntimeMetrics>,
    export: bool,
}

impl MetricsRecorder {
    /// `export` controls whether values are also pushed to the `metrics` facade
    pub fn new(export: bool) -> Self {
        Self {
            inner: RwLock::new(RuntimeMetrics::default()),
            export,
        }
    }

    pub fn snapshot(&self) -> RuntimeMetrics {
        *self.inner.read()
    }

    pub fn agent_created(&self) {
        let active = {
            let mut m = self.inner.write();
            m.total_agents_created += 1;
            m.current_active_agents += 1;
            m.current_active_agents
        };
        if self.export {
            metrics::counter!(AGENTS_CREATED).increment(1);
            metrics::gauge!(ACTIVE_AGENTS).set(active as f64);
        }
    }

    pub fn agent_stopped(&self) {
        let active = {
            let mut m = self.inner.write();
            m.total_agents_stopped += 1;
            m.current_active_agents = m.current_active_agents.saturating_sub(1);
            m.current_active_agents
        };
        if self.export {
            metrics::counter!(AGENTS_STOPPED).increment(1);
            metrics::gauge!(ACTIVE_AGENTS).set(active as f64);
        }
    }

    /// An agent left the active set by failing; not counted as stopped
    pub fn agent_failed(&self) {
        let active = {
            let mut m = self.inner.write();
            m.current_active_agents = m.current_active_agents.saturating_sub(1);
            m.current_active_agents
        };
        if self.export {
            metrics::gauge!(ACTIVE_AGENTS).set(active as f64);
        }
    }

    /// A stopped agent was brought back by a restart
    pub fn agent_reactivated(&self) {
        let active = {
            let mut m = self.inner.write();
            m.current_active_agents += 1;
            m.current_active_agents
        };
        if self.export {
            metrics::gauge!(ACTIVE_AGENTS).set(active as f64);
        }
    }

    /// Seed the active gauge after loading agents from a registry
    pub fn set_active_agents(&self, count: u64) {
        self.inner.write().current_active_agents = count;
        if self.export {
            metrics::gauge!(ACTIVE_AGENTS).set(count as f64);
        }
    }

    /// Count a task as running until the returned guard drops
    pub fn task_started(&self) -> RunningTaskGuard<'_> {
        let running = {
            let mut m = self.inner.write();
            m.current_running_tasks += 1;
            m.current_running_tasks
        };
        if self.export {
            metrics::gauge!(RUNNING_TASKS).set(running as f64);
        }
        RunningTaskGuard { recorder: self }
    }

    pub fn task_finished(&self, success: bool, elapsed: Duration) {
        {
            let mut m = self.inner.write();
            m.total_tasks_executed += 1;
            if !success {
                m.total_tasks_failed += 1;
            }
        }
        if self.export {
            metrics::counter!(TASKS_EXECUTED).increment(1);
            if !success {
                metrics::counter!(TASKS_FAILED).increment(1);
            }
            metrics::histogram!(TASK_DURATION).record(elapsed.as_secs_f64());
        }
    }

    pub fn tasks_cancelled(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.inner.write().total_tasks_cancelled += count;
        if self.export {
            metrics::counter!(TASKS_CANCELLED).increment(count);
        }
    }

    fn running_task_done(&self) {
        let running = {
            let mut m = self.inner.write();
            m.current_running_tasks = m.current_running_tasks.saturating_sub(1);
            m.current_running_tasks
        };
        if self.export {
            metrics::gauge!(RUNNING_TASKS).set(running as f64);
        }
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Decrements the running-task gauge on drop
pub struct RunningTaskGuard<'a> {
    recorder: &'a MetricsRecorder,
}

impl Drop for RunningTaskGuard<'_> {
    fn drop(&mut self) {
        self.recorder.running_task_done();
    }
}
