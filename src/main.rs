// src/main.rs
//! Cortex runtime daemon
//!
//! Hosts a runtime manager and agent coordinator until interrupted, then
//! shuts both down within the configured timeout.

use anyhow::{Context, Result};
use cortex_runtime::observability::{init_metrics, init_tracing};
use cortex_runtime::orchestration::AgentCoordinator;
use cortex_runtime::registry::{AgentRegistry, AgentTypeCatalog, InMemoryRegistry, SqliteRegistry};
use cortex_runtime::runtime::{EchoHandler, RuntimeManager, SleepHandler};
use cortex_runtime::utils::config::{BootstrapAgent, RegistryBackend, RegistryConfig, RuntimeConfig};
use cortex_runtime::BuildInfo;
use std::sync::Arc;
use tracing::{error, info, warn};

const DEFAULT_DB_PATH: &str = "data/agents.db";

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first: it decides how we log
    let config = RuntimeConfig::load().context("failed to load configuration")?;

    init_tracing(&config.observability.log_level, config.observability.log_format)?;
    if let Some(addr) = config.observability.metrics_addr {
        init_metrics(addr)?;
        info!("Prometheus exporter listening on {}", addr);
    }

    let build = BuildInfo::current();
    info!(
        "Starting Cortex runtime v{} ({}, built with {})",
        build.version, build.git_hash, build.rustc_version
    );

    let catalog = AgentTypeCatalog::with_builtins();
    if let Some(dir) = &config.agent_types.directory {
        let loaded = catalog
            .load_dir(dir)
            .with_context(|| format!("failed to load agent types from {}", dir.display()))?;
        info!("Loaded {} agent types from {}", loaded, dir.display());
    }

    let mut builder = RuntimeManager::builder(config.manager.clone()).catalog(catalog);
    if let Some(registry) = open_registry(&config.registry).await? {
        builder = builder.registry(registry);
    }
    let manager = builder.build().await;

    manager.register_handler("echo", Arc::new(EchoHandler));
    manager.register_handler("sleep", Arc::new(SleepHandler::default()));

    for agent in &config.bootstrap {
        if let Err(e) = bootstrap(&manager, agent).await {
            error!("Failed to bootstrap agent {}: {}", agent.name, e);
        }
    }

    let coordinator = AgentCoordinator::new(config.coordinator.clone(), Arc::clone(&manager));
    coordinator.start();

    info!(
        "Runtime ready with {} agents (max {})",
        manager.agent_count(),
        config.manager.max_agents
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal, cleaning up...");

    coordinator.stop().await;

    match manager.shutdown().await {
        Ok(()) => {
            let metrics = manager.metrics();
            info!(
                "Runtime stopped gracefully ({} tasks executed, {} failed, {} cancelled)",
                metrics.total_tasks_executed,
                metrics.total_tasks_failed,
                metrics.total_tasks_cancelled
            );
            Ok(())
        }
        Err(e) => {
            error!("Shutdown error: {}", e);
            Err(e.into())
        }
    }
}

async fn open_registry(config: &RegistryConfig) -> Result<Option<Arc<dyn AgentRegistry>>> {
    let registry: Arc<dyn AgentRegistry> = match config.backend {
        RegistryBackend::None => {
            warn!("No agent registry configured; agents will not survive a restart");
            return Ok(None);
        }
        RegistryBackend::Memory => Arc::new(InMemoryRegistry::new()),
        RegistryBackend::Sqlite => {
            let path = config
                .path
                .clone()
                .unwrap_or_else(|| DEFAULT_DB_PATH.into());
            let registry = SqliteRegistry::open(&path)
                .await
                .with_context(|| format!("failed to open registry at {}", path.display()))?;
            Arc::new(registry)
        }
    };
    Ok(Some(registry))
}

async fn bootstrap(manager: &RuntimeManager, declared: &BootstrapAgent) -> cortex_runtime::Result<()> {
    let agent = match &declared.config {
        Some(config) => {
            manager
                .create_agent(&declared.name, &declared.agent_type, config.clone())
                .await?
        }
        None => {
            manager
                .create_agent_of_type(&declared.name, &declared.agent_type)
                .await?
        }
    };

    if declared.start {
        manager.start_agent(agent.id()).await?;
    }
    info!("Bootstrapped agent {} ({})", agent.name(), agent.id());
    Ok(())
}
