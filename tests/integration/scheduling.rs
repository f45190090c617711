//! Scheduling integration tests.
//!
//! These tests verify dependency ordering, FIFO dispatch among equal
//! priorities, and the global concurrency bound.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use agentflow::{
    AgentSpec, Error, Orchestrator, StrategyKind, TaskId, TaskSpec, TaskState,
};

use crate::fixtures::{
    fast_config, orchestrator_with_agents, wait_for_state, wait_terminal, ScriptedExecutor,
    CAPABILITY,
};

fn task(id: &str) -> TaskSpec {
    TaskSpec::new(id, CAPABILITY).with_id(id)
}

/// Test: Dependency soundness on random DAGs
/// Given randomly generated DAGs submitted as one batch
/// When every task completes
/// Then no task started before each of its prerequisites finished
#[tokio::test]
async fn test_random_dag_dependency_soundness() {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for round in 0..3 {
        let executor = ScriptedExecutor::new(Duration::from_millis(2));
        let mut config = fast_config();
        config.scheduler.max_concurrent_tasks = 6;
        let orchestrator = orchestrator_with_agents(config, executor.clone(), 3, 4);
        orchestrator.start().unwrap();

        let count = 30;
        let mut edges: Vec<(TaskId, Vec<TaskId>)> = Vec::new();
        let mut specs = Vec::new();
        for i in 0..count {
            let id = TaskId::from(format!("r{}-t{}", round, i));
            let deps: Vec<TaskId> = (0..i)
                .filter(|_| rng.gen_bool(0.15))
                .map(|j| TaskId::from(format!("r{}-t{}", round, j)))
                .collect();
            specs.push(
                TaskSpec::new(id.as_str(), CAPABILITY)
                    .with_id(id.clone())
                    .with_dependencies(deps.clone()),
            );
            edges.push((id, deps));
        }
        // Submit in shuffled order; dependencies may point forward within the batch.
        for i in (1..specs.len()).rev() {
            let j = rng.gen_range(0..=i);
            specs.swap(i, j);
        }

        let ids = orchestrator.submit_tasks(specs).await.unwrap();
        wait_terminal(&orchestrator, &ids, Duration::from_secs(10)).await;

        for (id, deps) in &edges {
            let status = orchestrator.task_status(id).await.unwrap();
            assert_eq!(status.state, TaskState::Completed, "task {}", id);
            let started = executor.started_seq(id).unwrap();
            for dep in deps {
                let finished = executor.finished_seq(dep).unwrap();
                assert!(
                    finished < started,
                    "{} started at {} before {} finished at {}",
                    id,
                    started,
                    dep,
                    finished
                );
            }
        }
        orchestrator.shutdown().await;
    }
}

/// Test: Cycles are never admitted
/// Given a batch whose dependencies form a cycle
/// When it is submitted
/// Then it is rejected and the same ids can be admitted without the cycle
#[tokio::test]
async fn test_cyclic_batch_leaves_graph_unchanged() {
    let executor = ScriptedExecutor::new(Duration::from_millis(1));
    let orchestrator = orchestrator_with_agents(fast_config(), executor, 1, 1);

    let err = orchestrator
        .submit_tasks(vec![
            task("a").with_dependencies(vec![TaskId::from("c")]),
            task("b").with_dependencies(vec![TaskId::from("a")]),
            task("c").with_dependencies(vec![TaskId::from("b")]),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CycleDetected { .. }));
    for id in ["a", "b", "c"] {
        assert!(matches!(
            orchestrator.task_status(&TaskId::from(id)).await.unwrap_err(),
            Error::TaskNotFound(_)
        ));
    }

    orchestrator.start().unwrap();
    let ids = orchestrator
        .submit_tasks(vec![
            task("a"),
            task("b").with_dependencies(vec![TaskId::from("a")]),
            task("c").with_dependencies(vec![TaskId::from("b")]),
        ])
        .await
        .unwrap();
    wait_terminal(&orchestrator, &ids, Duration::from_secs(5)).await;
    orchestrator.shutdown().await;
}

/// Test: FIFO among equal priorities
/// Given 50 equal-priority tasks and a single agent with capacity 1
/// When they are dispatched
/// Then they start in submission order
#[tokio::test]
async fn test_fifo_equal_priority() {
    let executor = ScriptedExecutor::new(Duration::from_millis(1));
    let mut config = fast_config();
    config.scheduler.max_concurrent_tasks = 1;
    // No age or deadline rules: every task has the same effective priority.
    let orchestrator = Orchestrator::with_components(
        config,
        executor.clone(),
        StrategyKind::LeastLoaded.build(),
        Vec::new(),
    )
    .unwrap();
    orchestrator
        .register_agent(AgentSpec::new("solo", [CAPABILITY]).with_id("solo"))
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..50 {
        ids.push(
            orchestrator
                .submit_task(task(&format!("fifo-{:02}", i)))
                .await
                .unwrap(),
        );
    }
    orchestrator.start().unwrap();
    wait_terminal(&orchestrator, &ids, Duration::from_secs(10)).await;

    assert_eq!(executor.start_order(), ids);
    orchestrator.shutdown().await;
}

/// Test: FIFO among equal priorities with the built-in rules
/// Given the default age, deadline, and business-value rules with a fast re-rank
/// And 50 equal-priority tasks submitted a few milliseconds apart
/// When a single agent with capacity 1 runs them
/// Then they start in submission order
#[tokio::test]
async fn test_fifo_equal_priority_default_rules() {
    let executor = ScriptedExecutor::new(Duration::from_millis(1));
    let mut config = fast_config();
    config.scheduler.max_concurrent_tasks = 1;
    config.priority.recompute_interval_ms = 3;
    let orchestrator = orchestrator_with_agents(config, executor.clone(), 0, 1);
    orchestrator.start().unwrap();

    // Nothing can run yet, so every task waits in the queue across re-ranks.
    let mut ids = Vec::new();
    for i in 0..50 {
        if i % 5 == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        ids.push(
            orchestrator
                .submit_task(task(&format!("aged-{:02}", i)))
                .await
                .unwrap(),
        );
    }
    orchestrator
        .register_agent(AgentSpec::new("solo", [CAPABILITY]).with_id("solo"))
        .unwrap();
    wait_terminal(&orchestrator, &ids, Duration::from_secs(10)).await;

    assert_eq!(executor.start_order(), ids);
    orchestrator.shutdown().await;
}

/// Test: Bounded concurrency
/// Given max_concurrent_tasks = 3 and an agent with effectively unlimited capacity
/// When 100 tasks of 50ms each run
/// Then no more than 3 are ever running at once
#[tokio::test]
async fn test_bounded_concurrency() {
    let executor = ScriptedExecutor::new(Duration::from_millis(50));
    let mut config = fast_config();
    config.scheduler.max_concurrent_tasks = 3;
    let orchestrator = orchestrator_with_agents(config, executor.clone(), 1, 10_000);
    orchestrator.start().unwrap();

    let specs = (0..100).map(|i| task(&format!("load-{}", i))).collect();
    let ids = orchestrator.submit_tasks(specs).await.unwrap();

    let sampler = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let mut peak = 0;
            loop {
                let status = orchestrator.system_status().await;
                let running = status.count(TaskState::Running) + status.count(TaskState::Assigned);
                assert!(running <= 3, "{} tasks running", running);
                assert!(status.active_executions <= 3);
                peak = peak.max(running);
                if status.count(TaskState::Completed) == 100 {
                    return peak;
                }
                tokio::time::sleep(Duration::from_millis(7)).await;
            }
        })
    };

    wait_terminal(&orchestrator, &ids, Duration::from_secs(20)).await;
    let peak = sampler.await.unwrap();
    assert!(peak >= 1);
    assert!(executor.max_running() <= 3);
    assert_eq!(executor.max_running(), 3);

    let status = orchestrator.system_status().await;
    assert_eq!(status.count(TaskState::Completed), 100);
    assert_eq!(status.metrics.dispatched, 100);
    assert_eq!(status.success_rate, 1.0);
    orchestrator.shutdown().await;
}

/// Test: Fan-out after a shared prerequisite
/// Given A, and B and C depending on A, with one agent
/// When A succeeds after 10ms
/// Then B and C complete and both start strictly after A finished
#[tokio::test]
async fn test_fan_out_after_prerequisite() {
    let executor = ScriptedExecutor::new(Duration::from_millis(10));
    let orchestrator = orchestrator_with_agents(fast_config(), executor.clone(), 1, 2);
    orchestrator.start().unwrap();

    let a = TaskId::from("A");
    orchestrator
        .submit_tasks(vec![
            task("A"),
            task("B").with_dependencies(vec![a.clone()]),
            task("C").with_dependencies(vec![a.clone()]),
        ])
        .await
        .unwrap();

    let limit = Duration::from_secs(5);
    let a_status = wait_for_state(&orchestrator, &a, TaskState::Completed, limit).await;
    let a_finished = a_status.finished_at.unwrap();
    let a_seq = executor.finished_seq(&a).unwrap();

    for id in ["B", "C"] {
        let id = TaskId::from(id);
        let status = wait_for_state(&orchestrator, &id, TaskState::Completed, limit).await;
        assert!(status.started_at.unwrap() >= a_finished);
        assert!(executor.started_seq(&id).unwrap() > a_seq);
    }
    orchestrator.shutdown().await;
}

/// Test: A task waits for an agent with its capability
/// Given tasks for two capabilities and agents for only one
/// When the dispatcher runs
/// Then the other capability's task stays queued without blocking the rest
#[tokio::test]
async fn test_unmatched_capability_does_not_block_queue() {
    let executor = ScriptedExecutor::new(Duration::from_millis(1));
    let orchestrator = orchestrator_with_agents(fast_config(), executor, 1, 1);

    let gpu = orchestrator
        .submit_task(
            TaskSpec::new("render", "gpu")
                .with_id("render")
                .with_priority(agentflow::Priority::Critical),
        )
        .await
        .unwrap();
    let ids = orchestrator
        .submit_tasks((0..5).map(|i| task(&format!("cpu-{}", i))).collect())
        .await
        .unwrap();
    orchestrator.start().unwrap();

    wait_terminal(&orchestrator, &ids, Duration::from_secs(5)).await;
    assert_eq!(
        orchestrator.task_status(&gpu).await.unwrap().state,
        TaskState::Ready
    );
    assert_eq!(orchestrator.system_status().await.queue_depth, 1);
    orchestrator.shutdown().await;
}
