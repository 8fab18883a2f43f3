// src/orchestration/dependency_graph.rs
//! Ready/blocked bookkeeping for dependent tasks
//!
//! Nodes are task IDs. An edge `a -> b` means `b` depends on `a` and may not
//! be dispatched until `a` has completed. Ordered collections keep every
//! listing deterministic.

use crate::utils::errors::{Result, RuntimeError};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// node -> nodes it depends on
    dependencies: BTreeMap<String, BTreeSet<String>>,
    /// node -> nodes depending on it
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node; adding an existing node is a no-op
    pub fn add_node(&mut self, id: impl Into<String>) {
        let id = id.into();
        self.dependents.entry(id.clone()).or_default();
        self.dependencies.entry(id).or_default();
    }

    /// Record that `to` depends on `from`
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<()> {
        for node in [from, to] {
            if !self.dependencies.contains_key(node) {
                return Err(RuntimeError::UnknownNode(node.to_string()));
            }
        }
        if from == to {
            return Err(RuntimeError::DependencyCycle(from.to_string()));
        }

        if let Some(deps) = self.dependencies.get_mut(to) {
            deps.insert(from.to_string());
        }
        if let Some(children) = self.dependents.get_mut(from) {
            children.insert(to.to_string());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.dependencies.contains_key(id)
    }

    pub fn dependencies_of(&self, id: &str) -> Vec<String> {
        self.dependencies
            .get(id)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        self.dependents
            .get(id)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Fails with the first node found on a cycle
    pub fn validate_acyclic(&self) -> Result<()> {
        self.execution_batches().map(|_| ())
    }

    pub fn topological_order(&self) -> Result<Vec<String>> {
        Ok(self.execution_batches()?.into_iter().flatten().collect())
    }

    /// Groups of nodes that can run concurrently, in dependency order
    pub fn execution_batches(&self) -> Result<Vec<Vec<String>>> {
        let mut remaining: BTreeMap<&str, usize> = self
            .dependencies
            .iter()
            .map(|(id, deps)| (id.as_str(), deps.len()))
            .collect();

        let mut batches = Vec::new();
        let mut frontier: VecDeque<&str> = remaining
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut placed = 0;

        while !frontier.is_empty() {
            let batch: Vec<&str> = frontier.drain(..).collect();
            let mut next = BTreeSet::new();

            for &id in &batch {
                remaining.remove(id);
                for child in self.dependents.get(id).into_iter().flatten() {
                    if let Some(count) = remaining.get_mut(child.as_str()) {
                        *count -= 1;
                        if *count == 0 {
                            next.insert(child.as_str());
                        }
                    }
                }
            }

            placed += batch.len();
            batches.push(batch.into_iter().map(str::to_string).collect());
            frontier.extend(next);
        }

        if placed < self.dependencies.len() {
            let stuck = remaining.keys().next().copied().unwrap_or_default();
            return Err(RuntimeError::DependencyCycle(stuck.to_string()));
        }
        Ok(batches)
    }

    /// Whether every dependency of `id` is in `completed`
    pub fn is_ready(&self, id: &str, completed: &HashSet<String>) -> bool {
        self.dependencies
            .get(id)
            .is_some_and(|deps| deps.iter().all(|dep| completed.contains(dep)))
    }

    /// Nodes not yet completed whose dependencies all are
    pub fn ready_nodes(&self, completed: &HashSet<String>) -> Vec<String> {
        self.dependencies
            .keys()
            .filter(|id| !completed.contains(*id) && self.is_ready(id, completed))
            .cloned()
            .collect()
    }

    /// Nodes not yet completed that still wait on something
    pub fn blocked_nodes(&self, completed: &HashSet<String>) -> Vec<String> {
        self.dependencies
            .keys()
            .filter(|id| !completed.contains(*id) && !self.is_ready(id, completed))
            .cloned()
            .collect()
    }
}
