//! Cancellation and shutdown integration tests.

use std::time::Duration;

use agentflow::core::ExecutionOutcome;
use agentflow::orchestration::topics;
use agentflow::{AgentId, CancelReason, Error, TaskId, TaskSpec, TaskState};

use crate::fixtures::{
    fast_config, orchestrator_with_agents, wait_for_state, Behavior, EventLog, ScriptedExecutor,
    CAPABILITY,
};

const LIMIT: Duration = Duration::from_secs(30);

fn task(id: &str) -> TaskSpec {
    TaskSpec::new(id, CAPABILITY).with_id(id)
}

fn dependency_failed(dependency: &str, root: &str) -> Option<CancelReason> {
    Some(CancelReason::DependencyFailed {
        dependency: TaskId::from(dependency),
        root: TaskId::from(root),
    })
}

/// Test: Idempotent cancel
/// Given a queued task that no agent can take
/// When it is cancelled twice
/// Then both calls succeed and only one cancellation is recorded
#[tokio::test]
async fn test_cancel_is_idempotent() {
    let executor = ScriptedExecutor::new(Duration::from_millis(1));
    let orchestrator = orchestrator_with_agents(fast_config(), executor, 0, 1);
    let (events, _) = EventLog::subscribe(&orchestrator, topics::TASK_CANCELLED);
    orchestrator.start().unwrap();

    let id = orchestrator.submit_task(task("queued")).await.unwrap();
    orchestrator.cancel_task(&id).await.unwrap();
    orchestrator.cancel_task(&id).await.unwrap();

    let status = orchestrator.task_status(&id).await.unwrap();
    assert_eq!(status.state, TaskState::Cancelled);
    assert_eq!(status.cancel_reason, Some(CancelReason::Requested));
    assert_eq!(orchestrator.system_status().await.queue_depth, 0);

    events.wait_for_count(topics::TASK_CANCELLED, 1, LIMIT).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(events.count(topics::TASK_CANCELLED), 1);
    assert_eq!(orchestrator.system_status().await.metrics.cancelled, 1);

    assert!(matches!(
        orchestrator.cancel_task(&TaskId::from("missing")).await.unwrap_err(),
        Error::TaskNotFound(_)
    ));
    orchestrator.shutdown().await;
}

/// Test: Cancel a running task
/// Given a task whose executor runs until cancelled
/// When the task is cancelled while running
/// Then it is Cancelled at once and its agent slot frees once the executor returns
#[tokio::test]
async fn test_cancel_running_task() {
    let executor = ScriptedExecutor::new(Duration::from_millis(1));
    executor.set("long", Behavior::Block);
    let orchestrator = orchestrator_with_agents(fast_config(), executor, 1, 1);
    orchestrator.start().unwrap();

    let id = orchestrator.submit_task(task("long")).await.unwrap();
    wait_for_state(&orchestrator, &id, TaskState::Running, LIMIT).await;

    orchestrator.cancel_task(&id).await.unwrap();
    assert_eq!(
        orchestrator.task_status(&id).await.unwrap().state,
        TaskState::Cancelled
    );

    let agent = AgentId::from("agent-0");
    let deadline = tokio::time::Instant::now() + LIMIT;
    while orchestrator.execution_records(&id).is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "attempt never finished");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let records = orchestrator.execution_records(&id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, ExecutionOutcome::Cancelled);
    assert_eq!(orchestrator.agent(&agent).unwrap().load, 0);
    assert_eq!(orchestrator.agent(&agent).unwrap().consecutive_failures, 0);

    let next = orchestrator.submit_task(task("next")).await.unwrap();
    wait_for_state(&orchestrator, &next, TaskState::Completed, LIMIT).await;
    orchestrator.shutdown().await;
}

/// Test: Cascading cancellation on failure
/// Given A <- B <- C and an unrelated task E
/// When A fails permanently
/// Then B and C are cancelled with A as the root cause and E completes
#[tokio::test]
async fn test_failure_cascades_transitively() {
    let executor = ScriptedExecutor::new(Duration::from_millis(5));
    executor.set("A", Behavior::Fail);
    let orchestrator = orchestrator_with_agents(fast_config(), executor.clone(), 2, 1);
    orchestrator.start().unwrap();

    orchestrator
        .submit_tasks(vec![
            task("A").with_max_retries(0),
            task("B").with_dependencies(vec![TaskId::from("A")]),
            task("C").with_dependencies(vec![TaskId::from("B")]),
            task("E"),
        ])
        .await
        .unwrap();

    wait_for_state(&orchestrator, &TaskId::from("A"), TaskState::Failed, LIMIT).await;
    let b = wait_for_state(&orchestrator, &TaskId::from("B"), TaskState::Cancelled, LIMIT).await;
    let c = wait_for_state(&orchestrator, &TaskId::from("C"), TaskState::Cancelled, LIMIT).await;
    assert_eq!(b.cancel_reason, dependency_failed("A", "A"));
    assert_eq!(c.cancel_reason, dependency_failed("B", "A"));
    wait_for_state(&orchestrator, &TaskId::from("E"), TaskState::Completed, LIMIT).await;

    // Neither cancelled task ever reached an agent.
    assert!(executor.started_seq(&TaskId::from("B")).is_none());
    assert!(executor.started_seq(&TaskId::from("C")).is_none());

    let status = orchestrator.system_status().await;
    assert_eq!(status.count(TaskState::Cancelled), 2);
    assert_eq!(status.metrics.cancelled, 2);
    orchestrator.shutdown().await;
}

/// Test: Cancelling a pending task cascades downstream only
/// Given A <- B <- C with A still running
/// When B is cancelled
/// Then C is cancelled with B as the root and A still completes
#[tokio::test]
async fn test_cancel_pending_cascades_downstream() {
    let executor = ScriptedExecutor::new(Duration::from_millis(50));
    let orchestrator = orchestrator_with_agents(fast_config(), executor, 1, 1);
    orchestrator.start().unwrap();

    orchestrator
        .submit_tasks(vec![
            task("A"),
            task("B").with_dependencies(vec![TaskId::from("A")]),
            task("C").with_dependencies(vec![TaskId::from("B")]),
        ])
        .await
        .unwrap();
    orchestrator.cancel_task(&TaskId::from("B")).await.unwrap();

    let c = orchestrator.task_status(&TaskId::from("C")).await.unwrap();
    assert_eq!(c.state, TaskState::Cancelled);
    assert_eq!(c.cancel_reason, dependency_failed("B", "B"));
    wait_for_state(&orchestrator, &TaskId::from("A"), TaskState::Completed, LIMIT).await;
    orchestrator.shutdown().await;
}

/// Test: Graceful shutdown
/// Given one task in flight, one queued without an agent, and one pending
/// When the orchestrator shuts down
/// Then the in-flight task finishes, the rest are cancelled, and new work is refused
#[tokio::test]
async fn test_shutdown_drains_and_cancels_leftovers() {
    let executor = ScriptedExecutor::new(Duration::from_millis(50));
    let orchestrator = orchestrator_with_agents(fast_config(), executor, 1, 1);
    orchestrator.start().unwrap();

    let running = orchestrator.submit_task(task("running")).await.unwrap();
    wait_for_state(&orchestrator, &running, TaskState::Running, LIMIT).await;
    let queued = orchestrator
        .submit_task(TaskSpec::new("gpu", "gpu").with_id("gpu"))
        .await
        .unwrap();
    let pending = orchestrator
        .submit_task(task("pending").with_dependencies(vec![queued.clone()]))
        .await
        .unwrap();

    let report = orchestrator.shutdown().await;
    assert!(report.drained);
    assert_eq!(report.forced, 0);
    assert_eq!(report.cancelled, 2);

    assert_eq!(
        orchestrator.task_status(&running).await.unwrap().state,
        TaskState::Completed
    );
    for id in [&queued, &pending] {
        let status = orchestrator.task_status(id).await.unwrap();
        assert_eq!(status.state, TaskState::Cancelled);
        assert_eq!(status.cancel_reason, Some(CancelReason::Shutdown));
    }

    let status = orchestrator.system_status().await;
    assert!(!status.accepting);
    assert_eq!(status.queue_depth, 0);
    assert!(matches!(
        orchestrator.submit_task(task("late")).await.unwrap_err(),
        Error::ShuttingDown
    ));
    assert!(matches!(orchestrator.start().unwrap_err(), Error::ShuttingDown));

    // A second shutdown has nothing left to do.
    let again = orchestrator.shutdown().await;
    assert_eq!(again.cancelled, 0);
}

/// Test: Forced shutdown
/// Given an executor that ignores cancellation
/// When the shutdown grace period expires
/// Then the attempt is forced and the task is cancelled for shutdown
#[tokio::test(start_paused = true)]
async fn test_shutdown_forces_stragglers() {
    let executor = ScriptedExecutor::with_default(Duration::ZERO, Behavior::Stubborn);
    let mut config = fast_config();
    config.scheduler.shutdown_grace_ms = 100;
    config.scheduler.cancel_grace_ms = 50;
    let orchestrator = orchestrator_with_agents(config, executor, 1, 1);
    orchestrator.start().unwrap();

    let id = orchestrator.submit_task(task("stuck")).await.unwrap();
    wait_for_state(&orchestrator, &id, TaskState::Running, LIMIT).await;

    let report = orchestrator.shutdown().await;
    assert!(!report.drained);
    assert_eq!(report.forced, 1);

    let status = orchestrator.task_status(&id).await.unwrap();
    assert_eq!(status.state, TaskState::Cancelled);
    assert_eq!(status.cancel_reason, Some(CancelReason::Shutdown));
    assert_eq!(orchestrator.system_status().await.active_executions, 0);
}
