// src/runtime/mod.rs
//! Agent execution runtime
//!
//! This module provides the agent execution environment, including:
//!
//! - **Agent**: lifecycle state machine, task intake queue and counters
//! - **Executor**: runs one task against its handler with a timeout
//! - **Worker Pool**: per-agent workers, heartbeat and supervision loop
//! - **Manager**: agent population, lifecycle operations, health scan
//! - **Extensions**: optional messaging, memory and task manager services
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   RuntimeManager                     │
//! │                                                      │
//! │   Agent A                      Agent B               │
//! │  ┌────────────────────┐       ┌────────────────────┐ │
//! │  │ TaskQueue          │       │ TaskQueue          │ │
//! │  │   │   │   │        │       │   │   │            │ │
//! │  │   ▼   ▼   ▼        │       │   ▼   ▼            │ │
//! │  │  W1  W2  W3  ♥     │       │  W1  W2  ♥         │ │
//! │  │   └───┴───┘        │       │   └───┘            │ │
//! │  │   supervision loop │       │   supervision loop │ │
//! │  └─────────┬──────────┘       └─────────┬──────────┘ │
//! │            └──────────┬─────────────────┘            │
//! │                  TaskResult broadcast                │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod executor;
pub mod extensions;
pub mod manager;
pub mod metrics;
pub mod task;
pub mod task_queue;
pub mod worker_pool;

// Re-export commonly used types
pub use agent::{Agent, AgentConfig, AgentFault, AgentState, ResourceHints};
pub use executor::TaskExecutor;
pub use extensions::{AgentExtensions, Extension, MemoryService, MessagingService, TaskManagerService};
pub use manager::{ManagerConfig, RuntimeManager, RuntimeManagerBuilder};
pub use metrics::{MetricsRecorder, RuntimeMetrics};
pub use task::{
    handler_fn, EchoHandler, SleepHandler, Task, TaskError, TaskHandler, TaskHandlerRegistry,
    TaskResult,
};
pub use task_queue::{QueueStats, TaskQueue};
pub use worker_pool::AgentWorkerPool;
