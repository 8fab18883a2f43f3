// src/registry/memory.rs
//! In-process registry backend

use crate::registry::{AgentRecord, AgentRegistry};
use crate::utils::errors::{Result, RuntimeError};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Default)]
pub struct InMemoryRegistry {
    records: DashMap<String, AgentRecord>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl AgentRegistry for InMemoryRegistry {
    async fn create(&self, record: &AgentRecord) -> Result<()> {
        match self.records.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(RuntimeError::Registry(format!(
                "agent {} already exists",
                record.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<AgentRecord>> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn list(&self) -> Result<Vec<AgentRecord>> {
        let mut records: Vec<AgentRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn update(&self, record: &AgentRecord) -> Result<()> {
        match self.records.get_mut(&record.id) {
            Some(mut existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(RuntimeError::AgentNotFound(record.id.clone())),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::AgentNotFound(id.to_string()))
    }
}
