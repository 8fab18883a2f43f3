// src/orchestration/mod.rs
//! Multi-agent coordination
//!
//! The [`AgentCoordinator`] picks agents for work and reserves capacity on
//! them. It only reads from the [`RuntimeManager`](crate::runtime::RuntimeManager)
//! and keeps its own load table under its own locks.

pub mod coordinator;
pub mod dependency_graph;
pub mod lease;
pub mod load;
pub mod selection;

pub use coordinator::{AgentCoordinator, CoordinatorConfig, LoadImbalance, RebalancePlan};
pub use dependency_graph::DependencyGraph;
pub use lease::AssignmentPermit;
pub use load::{health_score, AgentLoad, NoopProbe, ResourceProbe, ResourceUsage};
pub use selection::{AgentSelector, Candidate, SelectionStrategy};
