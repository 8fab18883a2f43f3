// tests/runtime_e2e.rs
//! End-to-end runtime scenarios: create, start, execute, stop, shut down

use bytes::Bytes;
use cortex_runtime::runtime::{
    handler_fn, AgentConfig, AgentState, EchoHandler, ManagerConfig, RuntimeManager, SleepHandler,
    Task, TaskError, TaskResult,
};
use cortex_runtime::RuntimeError;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn manager_config() -> ManagerConfig {
    ManagerConfig {
        max_agents: 10,
        shutdown_timeout: Duration::from_secs(5),
        enable_metrics: false,
        ..Default::default()
    }
}

fn two_workers() -> AgentConfig {
    AgentConfig {
        max_concurrent_tasks: 2,
        task_queue_size: 10,
        heartbeat_interval: Duration::from_millis(50),
        task_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

async fn collect(results: &mut broadcast::Receiver<TaskResult>, n: usize) -> Vec<TaskResult> {
    let mut collected = Vec::with_capacity(n);
    while collected.len() < n {
        let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .expect("timed out waiting for task results")
            .expect("result channel closed");
        collected.push(result);
    }
    collected
}

#[tokio::test]
async fn test_five_tasks_on_two_workers() {
    let manager = RuntimeManager::new(manager_config());
    manager.register_handler("echo", Arc::new(EchoHandler));
    let mut results = manager.subscribe_results();

    let agent = manager
        .create_agent("echo-agent", "worker", two_workers())
        .await
        .unwrap();
    manager.start_agent(agent.id()).await.unwrap();

    for i in 0..5 {
        agent
            .submit_task(Task::new("echo", format!("payload-{}", i)).with_id(format!("t{}", i)))
            .unwrap();
    }

    let collected = collect(&mut results, 5).await;
    let ids: HashSet<String> = collected.iter().map(|r| r.task_id.clone()).collect();
    assert_eq!(ids.len(), 5);
    assert!(collected.iter().all(|r| r.success && r.agent_id == agent.id()));

    let metrics = manager.metrics();
    assert_eq!(metrics.total_tasks_executed, 5);
    assert_eq!(metrics.total_tasks_failed, 0);
    assert_eq!(agent.completed_tasks(), 5);

    manager.shutdown().await.unwrap();
    assert_eq!(agent.state(), AgentState::Stopped);
}

#[tokio::test]
async fn test_timeout_and_failure_are_reported() {
    let manager = RuntimeManager::new(manager_config());
    manager.register_handler("sleep", Arc::new(SleepHandler::default()));
    manager.register_handler(
        "fail",
        handler_fn(|_task, _cancel| async move {
            Err::<Bytes, TaskError>(TaskError::Failed("bad input".into()))
        }),
    );
    let mut results = manager.subscribe_results();

    let agent = manager
        .create_agent("mixed", "worker", two_workers())
        .await
        .unwrap();
    manager.start_agent(agent.id()).await.unwrap();

    agent
        .submit_task(
            Task::new("sleep", "5000")
                .with_id("slow")
                .with_timeout(Duration::from_millis(50)),
        )
        .unwrap();
    agent.submit_task(Task::new("fail", "").with_id("bad")).unwrap();
    agent.submit_task(Task::new("unknown", "").with_id("orphan")).unwrap();

    let collected = collect(&mut results, 3).await;
    let by_id = |id: &str| {
        collected
            .iter()
            .find(|r| r.task_id == id)
            .cloned()
            .expect("missing result")
    };

    assert!(matches!(by_id("slow").error, Some(TaskError::Timeout(_))));
    assert!(matches!(
        by_id("slow").into_output(),
        Err(RuntimeError::TaskTimeout { .. })
    ));
    assert_eq!(by_id("bad").error, Some(TaskError::Failed("bad input".into())));
    assert!(matches!(by_id("orphan").error, Some(TaskError::NoHandler(_))));
    assert_eq!(manager.metrics().total_tasks_failed, 3);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_every_agent() {
    let manager = RuntimeManager::new(manager_config());
    manager.register_handler("sleep", Arc::new(SleepHandler::default()));
    let mut results = manager.subscribe_results();

    let a = manager.create_agent("a", "worker", two_workers()).await.unwrap();
    let b = manager.create_agent("b", "worker", two_workers()).await.unwrap();
    manager.start_agent(a.id()).await.unwrap();
    manager.start_agent(b.id()).await.unwrap();

    // long tasks are still in flight or queued when shutdown begins
    for i in 0..4 {
        a.submit_task(Task::new("sleep", "10000").with_id(format!("a{}", i))).unwrap();
        b.submit_task(Task::new("sleep", "10000").with_id(format!("b{}", i))).unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), manager.shutdown())
        .await
        .expect("shutdown hung")
        .unwrap();

    assert_eq!(a.state(), AgentState::Stopped);
    assert_eq!(b.state(), AgentState::Stopped);
    assert!(manager.is_shutting_down());

    // every submitted task produced exactly one result
    let collected = collect(&mut results, 8).await;
    assert!(collected.iter().all(|r| !r.success));
    let ids: HashSet<String> = collected.into_iter().map(|r| r.task_id).collect();
    assert_eq!(ids.len(), 8);

    let metrics = manager.metrics();
    assert_eq!(metrics.total_agents_stopped, 2);
    assert_eq!(metrics.current_active_agents, 0);

    assert!(matches!(
        manager.create_agent("late", "worker", two_workers()).await,
        Err(RuntimeError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_fatal_error_fails_agent() {
    let manager = RuntimeManager::new(manager_config());
    manager.register_handler(
        "crash",
        handler_fn(|_task, _cancel| async move {
            Err::<Bytes, TaskError>(TaskError::Fatal("corrupted state".into()))
        }),
    );
    let mut results = manager.subscribe_results();

    let agent = manager.create_agent("fragile", "worker", two_workers()).await.unwrap();
    manager.start_agent(agent.id()).await.unwrap();
    agent.submit_task(Task::new("crash", "")).unwrap();

    let collected = collect(&mut results, 1).await;
    assert!(matches!(collected[0].error, Some(TaskError::Fatal(_))));

    tokio::time::timeout(Duration::from_secs(2), async {
        while agent.state() != AgentState::Failed {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("agent never failed");

    // a failed agent can be restarted
    manager.restart_agent(agent.id()).await.unwrap();
    assert_eq!(agent.state(), AgentState::Running);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_isolated_agent_stop() {
    let manager = RuntimeManager::new(manager_config());
    manager.register_handler("echo", Arc::new(EchoHandler));
    let mut results = manager.subscribe_results();

    let a = manager.create_agent("a", "worker", two_workers()).await.unwrap();
    let b = manager.create_agent("b", "worker", two_workers()).await.unwrap();
    manager.start_agent(a.id()).await.unwrap();
    manager.start_agent(b.id()).await.unwrap();

    manager.stop_agent(a.id()).await.unwrap();
    assert!(a.is_cancelled());
    assert!(!b.is_cancelled());

    b.submit_task(Task::new("echo", "still here").with_id("b-task")).unwrap();
    let collected = collect(&mut results, 1).await;
    assert_eq!(collected[0].task_id, "b-task");
    assert!(collected[0].success);

    manager.shutdown().await.unwrap();
}
