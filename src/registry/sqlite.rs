// src/registry/sqlite.rs
//! SQLite registry backend
//!
//! One row per agent. Config and metadata are stored as JSON text,
//! timestamps as RFC 3339 strings.

use crate::registry::{AgentRecord, AgentRegistry};
use crate::runtime::agent::AgentState;
use crate::utils::errors::{Result, RuntimeError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

const SELECT_COLUMNS: &str =
    "SELECT id, name, agent_type, state, metadata, config, is_healthy, created_at, updated_at FROM agents";

pub struct SqliteRegistry {
    db: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteRegistry {
    /// Open (or create) the database at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                RuntimeError::Registry(format!("Failed to create directory: {}", e))
            })?;
        }

        let conn = Connection::open(&path)
            .map_err(|e| RuntimeError::Registry(format!("Failed to open database: {}", e)))?;
        init_schema(&conn)?;

        info!("Agent registry opened at {:?}", path);

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Private in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| RuntimeError::Registry(format!("Failed to open database: {}", e)))?;
        init_schema(&conn)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS agents (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            agent_type TEXT NOT NULL,
            state TEXT NOT NULL,
            metadata TEXT NOT NULL,
            config TEXT NOT NULL,
            is_healthy INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        [],
    )
    .map_err(|e| RuntimeError::Registry(format!("Schema creation failed: {}", e)))?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_agents_state ON agents(state)",
        [],
    )
    .map_err(|e| RuntimeError::Registry(format!("Index creation failed: {}", e)))?;

    Ok(())
}

/// Row as stored, before JSON and timestamp decoding
struct RawRow {
    id: String,
    name: String,
    agent_type: String,
    state: String,
    metadata: String,
    config: String,
    is_healthy: bool,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            agent_type: row.get(2)?,
            state: row.get(3)?,
            metadata: row.get(4)?,
            config: row.get(5)?,
            is_healthy: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn decode(self) -> Result<AgentRecord> {
        Ok(AgentRecord {
            state: self.state.parse::<AgentState>()?,
            metadata: serde_json::from_str(&self.metadata)?,
            config: serde_json::from_str(&self.config)?,
            is_healthy: self.is_healthy,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            name: self.name,
            agent_type: self.agent_type,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RuntimeError::Registry(format!("Bad timestamp '{}': {}", value, e)))
}

fn query_one(conn: &Connection, id: &str) -> Result<Option<AgentRecord>> {
    let sql = format!("{} WHERE id = ?1", SELECT_COLUMNS);
    let raw = conn
        .query_row(&sql, params![id], RawRow::from_row)
        .optional()
        .map_err(|e| RuntimeError::Registry(format!("Query failed: {}", e)))?;
    raw.map(RawRow::decode).transpose()
}

fn query_all(conn: &Connection) -> Result<Vec<AgentRecord>> {
    let sql = format!("{} ORDER BY id", SELECT_COLUMNS);
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| RuntimeError::Registry(format!("Query preparation failed: {}", e)))?;

    let rows = stmt
        .query_map([], RawRow::from_row)
        .map_err(|e| RuntimeError::Registry(format!("Query execution failed: {}", e)))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RuntimeError::Registry(format!("Result collection failed: {}", e)))?;

    rows.into_iter().map(RawRow::decode).collect()
}

#[async_trait]
impl AgentRegistry for SqliteRegistry {
    async fn create(&self, record: &AgentRecord) -> Result<()> {
        let metadata = serde_json::to_string(&record.metadata)?;
        let config = serde_json::to_string(&record.config)?;

        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO agents (id, name, agent_type, state, metadata, config, is_healthy, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.id,
                record.name,
                record.agent_type,
                record.state.as_str(),
                metadata,
                config,
                record.is_healthy,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| RuntimeError::Registry(format!("Failed to create agent {}: {}", record.id, e)))?;

        debug!("Persisted agent {}", record.id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<AgentRecord>> {
        let db = self.db.lock().await;
        query_one(&db, id)
    }

    async fn list(&self) -> Result<Vec<AgentRecord>> {
        let db = self.db.lock().await;
        query_all(&db)
    }

    async fn update(&self, record: &AgentRecord) -> Result<()> {
        let metadata = serde_json::to_string(&record.metadata)?;
        let config = serde_json::to_string(&record.config)?;

        let db = self.db.lock().await;
        let changed = db
            .execute(
                r#"
                UPDATE agents
                SET name = ?2, agent_type = ?3, state = ?4, metadata = ?5, config = ?6,
                    is_healthy = ?7, updated_at = ?8
                WHERE id = ?1
                "#,
                params![
                    record.id,
                    record.name,
                    record.agent_type,
                    record.state.as_str(),
                    metadata,
                    config,
                    record.is_healthy,
                    record.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| {
                RuntimeError::Registry(format!("Failed to update agent {}: {}", record.id, e))
            })?;

        if changed == 0 {
            return Err(RuntimeError::AgentNotFound(record.id.clone()));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let db = self.db.lock().await;
        let changed = db
            .execute("DELETE FROM agents WHERE id = ?1", params![id])
            .map_err(|e| RuntimeError::Registry(format!("Failed to delete agent {}: {}", id, e)))?;

        if changed == 0 {
            return Err(RuntimeError::AgentNotFound(id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::agent::{Agent, AgentConfig};
    use std::time::Duration;
    use tempfile::tempdir;

    fn record(name: &str) -> AgentRecord {
        let config = AgentConfig {
            max_concurrent_tasks: 3,
            heartbeat_interval: Duration::from_millis(1500),
            capabilities: vec!["nlp".to_string()],
            pool: Some("blue".to_string()),
            ..Default::default()
        };
        let agent = Agent::new(name, "worker", config);
        agent.set_metadata("zone", "eu-west");
        agent.to_record()
    }

    #[tokio::test]
    async fn test_registry_creation() {
        let dir = tempdir().unwrap();
        let registry = SqliteRegistry::open(dir.path().join("nested").join("agents.db")).await;
        assert!(registry.is_ok());
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let registry = SqliteRegistry::in_memory().unwrap();
        let rec = record("alpha");
        registry.create(&rec).await.unwrap();

        let loaded = registry.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "alpha");
        assert_eq!(loaded.config, rec.config);
        assert_eq!(loaded.metadata.get("zone").map(String::as_str), Some("eu-west"));
        assert_eq!(loaded.created_at, rec.created_at);

        assert!(registry.get("missing").await.unwrap().is_none());
        assert!(registry.create(&rec).await.is_err());
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let registry = SqliteRegistry::in_memory().unwrap();
        let mut rec = record("beta");
        registry.create(&rec).await.unwrap();

        rec.state = AgentState::Paused;
        registry.update(&rec).await.unwrap();
        assert_eq!(
            registry.get(&rec.id).await.unwrap().unwrap().state,
            AgentState::Paused
        );

        registry.delete(&rec.id).await.unwrap();
        assert!(matches!(
            registry.delete(&rec.id).await,
            Err(RuntimeError::AgentNotFound(_))
        ));
        assert!(matches!(
            registry.update(&rec).await,
            Err(RuntimeError::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agents.db");
        let (a, b) = (record("a"), record("b"));

        {
            let registry = SqliteRegistry::open(&path).await.unwrap();
            registry.create(&a).await.unwrap();
            registry.create(&b).await.unwrap();
        }

        let registry = SqliteRegistry::open(&path).await.unwrap();
        let listed = registry.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].id < listed[1].id);
    }
}
