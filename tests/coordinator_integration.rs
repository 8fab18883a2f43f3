// tests/coordinator_integration.rs
//! Coordinator against a live runtime manager

use cortex_runtime::orchestration::{
    AgentCoordinator, AgentSelector, CoordinatorConfig, SelectionStrategy,
};
use cortex_runtime::runtime::{
    Agent, AgentConfig, EchoHandler, ManagerConfig, RuntimeManager, SleepHandler, Task,
};
use cortex_runtime::RuntimeError;
use std::sync::Arc;
use std::time::Duration;

async fn setup(agents: usize) -> (Arc<RuntimeManager>, Vec<Arc<Agent>>) {
    let manager = RuntimeManager::new(ManagerConfig {
        enable_metrics: false,
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    });
    manager.register_handler("echo", Arc::new(EchoHandler));
    manager.register_handler("sleep", Arc::new(SleepHandler::default()));

    let mut created = Vec::new();
    for i in 0..agents {
        let agent = manager
            .create_agent(
                &format!("agent-{}", i),
                "worker",
                AgentConfig {
                    max_concurrent_tasks: 1,
                    task_queue_size: 20,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        manager.start_agent(agent.id()).await.unwrap();
        created.push(agent);
    }
    (manager, created)
}

fn ids(agents: &[Arc<Agent>]) -> Vec<String> {
    agents.iter().map(|a| a.id().to_string()).collect()
}

#[tokio::test]
async fn test_select_assign_redeem_produces_result() {
    let (manager, _agents) = setup(2).await;
    let coordinator = AgentCoordinator::new(CoordinatorConfig::default(), Arc::clone(&manager));
    let mut results = manager.subscribe_results();

    let chosen = coordinator
        .select_agents(&coordinator.default_selector(), 1)
        .await
        .unwrap();
    let agent = &chosen[0];

    let permit = coordinator
        .assign_task(agent.id(), Task::new("echo", "routed").with_id("job-1"), Some("exec-42"))
        .await
        .unwrap();
    assert_eq!(permit.agent_id(), agent.id());
    assert_eq!(coordinator.agent_load(agent.id()).await.queued_tasks, 1);

    permit.redeem(agent).unwrap();
    assert_eq!(coordinator.outstanding_permits(), 0);

    let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.task_id, "job-1");
    assert_eq!(result.agent_id, agent.id());
    assert_eq!(result.into_output().unwrap(), "routed");

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_round_robin_cycles_through_agents() {
    let (manager, agents) = setup(3).await;
    let coordinator = AgentCoordinator::new(CoordinatorConfig::default(), Arc::clone(&manager));
    let selector = AgentSelector::new(SelectionStrategy::RoundRobin);
    let expected = ids(&agents);

    let mut picked = Vec::new();
    for _ in 0..4 {
        picked.extend(ids(&coordinator.select_agents(&selector, 1).await.unwrap()));
    }
    assert_eq!(
        picked,
        vec![
            expected[0].clone(),
            expected[1].clone(),
            expected[2].clone(),
            expected[0].clone()
        ]
    );

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_least_loaded_avoids_busy_agent() {
    let (manager, agents) = setup(2).await;
    let coordinator = AgentCoordinator::new(CoordinatorConfig::default(), Arc::clone(&manager));

    // three permits held against the first agent
    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(
            coordinator
                .assign_task(agents[0].id(), Task::new("echo", ""), None)
                .await
                .unwrap(),
        );
    }

    let selector = AgentSelector::new(SelectionStrategy::LeastLoaded);
    let chosen = coordinator.select_agents(&selector, 1).await.unwrap();
    assert_eq!(chosen[0].id(), agents[1].id());

    held.clear();
    assert_eq!(coordinator.agent_load(agents[0].id()).await.queued_tasks, 0);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_overloaded_agent_is_refused() {
    let (manager, agents) = setup(1).await;
    let coordinator = AgentCoordinator::new(
        CoordinatorConfig {
            max_tasks_per_agent: 3,
            ..Default::default()
        },
        Arc::clone(&manager),
    );
    let id = agents[0].id();

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(coordinator.assign_task(id, Task::new("echo", ""), None).await.unwrap());
    }

    let before = coordinator.agent_load(id).await;
    let err = coordinator
        .assign_task(id, Task::new("echo", ""), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::AgentOverloaded { .. }));
    assert!(err.is_retryable());

    let after = coordinator.agent_load(id).await;
    assert_eq!(before.queued_tasks, after.queued_tasks);
    assert_eq!(before.active_tasks, after.active_tasks);

    drop(held);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stopped_agents_are_not_candidates() {
    let (manager, agents) = setup(2).await;
    let coordinator = AgentCoordinator::new(CoordinatorConfig::default(), Arc::clone(&manager));

    manager.stop_agent(agents[0].id()).await.unwrap();
    let available = coordinator.available_agents();
    assert_eq!(ids(&available), vec![agents[1].id().to_string()]);

    manager.stop_agent(agents[1].id()).await.unwrap();
    assert!(matches!(
        coordinator.select_agents(&AgentSelector::default(), 1).await,
        Err(RuntimeError::NoAgentsAvailable)
    ));
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rebalance_reports_real_queue_depth() {
    let (manager, agents) = setup(3).await;
    let coordinator = AgentCoordinator::new(CoordinatorConfig::default(), Arc::clone(&manager));

    // one worker per agent: the first sleep runs, the rest queue
    for i in 0..7 {
        agents[0]
            .submit_task(Task::new("sleep", "10000").with_id(format!("slow-{}", i)))
            .unwrap();
    }
    agents[1].submit_task(Task::new("sleep", "10000")).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(coordinator.refresh_loads(), 3);

    let plan = coordinator.rebalance_load().await.unwrap();
    assert_eq!(plan.total_tasks, 8);
    assert_eq!(plan.target_load, 2);
    assert_eq!(plan.overloaded.len(), 1);
    assert_eq!(plan.overloaded[0].agent_id, agents[0].id());
    assert_eq!(plan.overloaded[0].current_load, 7);
    // the idle third agent sits more than one task below the mean
    assert_eq!(plan.underloaded.len(), 1);
    assert_eq!(plan.underloaded[0].agent_id, agents[2].id());

    manager.shutdown().await.unwrap();
}
