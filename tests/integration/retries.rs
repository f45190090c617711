//! Retry and timeout integration tests.
//!
//! These run on tokio's paused clock so backoff delays and timeouts are
//! exact and instant.

use std::time::Duration;

use agentflow::core::{ExecutionOutcome, TaskStatus};
use agentflow::orchestration::{topics, EventKind};
use agentflow::{TaskId, TaskSpec, TaskState};

use crate::fixtures::{
    fast_config, orchestrator_with_agents, wait_for_state, Behavior, EventLog, ScriptedExecutor,
    CAPABILITY,
};

const LIMIT: Duration = Duration::from_secs(120);

fn task(id: &str) -> TaskSpec {
    TaskSpec::new(id, CAPABILITY).with_id(id)
}

/// Test: Retry exhaustion
/// Given a task with max_retries = 2 and an agent that always errors
/// When the task runs
/// Then it ends Failed after exactly 3 attempts, with one record each
#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion() {
    let executor = ScriptedExecutor::with_default(Duration::from_millis(5), Behavior::Fail);
    let orchestrator = orchestrator_with_agents(fast_config(), executor.clone(), 1, 1);
    let (events, _) = EventLog::subscribe(&orchestrator, "*");
    orchestrator.start().unwrap();

    let id = orchestrator
        .submit_task(task("A").with_max_retries(2))
        .await
        .unwrap();
    let status = wait_for_state(&orchestrator, &id, TaskState::Failed, LIMIT).await;
    assert_eq!(status.attempts, 3);
    assert!(status.reason.unwrap().contains("failed"));

    let records = orchestrator.execution_records(&id);
    assert_eq!(records.len(), 3);
    let attempts: Vec<u32> = records.iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(records.iter().all(|r| r.outcome == ExecutionOutcome::Failed));
    assert_eq!(executor.attempts().len(), 3);

    events.wait_for_count(topics::TASK_FAILED, 1, LIMIT).await;
    assert_eq!(events.count(topics::TASK_RETRIED), 2);
    assert_eq!(events.count(topics::TASK_STARTED), 3);

    let status = orchestrator.system_status().await;
    assert_eq!(status.metrics.failed, 1);
    assert_eq!(status.metrics.retries, 2);
    assert_eq!(status.success_rate, 0.0);
    orchestrator.shutdown().await;
}

/// Test: Backoff sequence
/// Given the 1s/5s/15s backoff and an always-failing agent
/// When a task with max_retries = 2 runs
/// Then retries start 1s and 5s after the failed attempts
#[tokio::test(start_paused = true)]
async fn test_backoff_sequence() {
    let executor = ScriptedExecutor::with_default(Duration::ZERO, Behavior::Fail);
    let mut config = fast_config();
    config.retry.backoff_ms = vec![1_000, 5_000, 15_000];
    let orchestrator = orchestrator_with_agents(config, executor.clone(), 1, 1);
    orchestrator.start().unwrap();

    let id = orchestrator
        .submit_task(task("slow-retry").with_max_retries(2))
        .await
        .unwrap();
    wait_for_state(&orchestrator, &id, TaskState::Failed, LIMIT).await;

    let starts: Vec<_> = executor.attempts().iter().map(|a| a.started_at).collect();
    assert_eq!(starts.len(), 3);
    let first_gap = starts[1] - starts[0];
    let second_gap = starts[2] - starts[1];
    assert!(first_gap >= Duration::from_secs(1), "{:?}", first_gap);
    assert!(first_gap < Duration::from_millis(1_500), "{:?}", first_gap);
    assert!(second_gap >= Duration::from_secs(5), "{:?}", second_gap);
    assert!(second_gap < Duration::from_millis(5_500), "{:?}", second_gap);
    orchestrator.shutdown().await;
}

/// Test: Retry then success
/// Given a task whose first attempt fails and a dependent task
/// When the retry succeeds
/// Then the task completes on attempt 2 and the dependent runs
#[tokio::test(start_paused = true)]
async fn test_retry_then_success_unblocks_dependent() {
    let executor = ScriptedExecutor::new(Duration::from_millis(5));
    executor.set("flaky", Behavior::FailTimes(1));
    let orchestrator = orchestrator_with_agents(fast_config(), executor.clone(), 1, 1);
    orchestrator.start().unwrap();

    orchestrator
        .submit_tasks(vec![
            task("flaky"),
            task("after").with_dependencies(vec![TaskId::from("flaky")]),
        ])
        .await
        .unwrap();

    let flaky = TaskId::from("flaky");
    let status = wait_for_state(&orchestrator, &flaky, TaskState::Completed, LIMIT).await;
    assert_eq!(status.attempts, 2);
    assert_eq!(status.output, Some(serde_json::json!(2)));
    let outcomes: Vec<ExecutionOutcome> = orchestrator
        .execution_records(&flaky)
        .iter()
        .map(|r| r.outcome)
        .collect();
    assert_eq!(
        outcomes,
        vec![ExecutionOutcome::Failed, ExecutionOutcome::Completed]
    );

    let after = wait_for_state(&orchestrator, &TaskId::from("after"), TaskState::Completed, LIMIT)
        .await;
    assert_eq!(after.attempts, 1);
    orchestrator.shutdown().await;
}

/// Test: Timeout with a cooperative executor
/// Given a task with a 100ms timeout whose executor waits for cancellation
/// When every attempt times out
/// Then the task ends TimedOut and each record says TimedOut
#[tokio::test(start_paused = true)]
async fn test_timeout_exhausts_to_timed_out() {
    let executor = ScriptedExecutor::with_default(Duration::ZERO, Behavior::Block);
    let orchestrator = orchestrator_with_agents(fast_config(), executor, 1, 1);
    let (events, _) = EventLog::subscribe(&orchestrator, topics::TASK_FAILED);
    orchestrator.start().unwrap();

    let id = orchestrator
        .submit_task(
            task("hang")
                .with_timeout(Duration::from_millis(100))
                .with_max_retries(1),
        )
        .await
        .unwrap();
    let status: TaskStatus = wait_for_state(&orchestrator, &id, TaskState::TimedOut, LIMIT).await;
    assert_eq!(status.attempts, 2);

    let records = orchestrator.execution_records(&id);
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.outcome == ExecutionOutcome::TimedOut));

    events.wait_for_count(topics::TASK_FAILED, 1, LIMIT).await;
    match &events.events()[0].kind {
        EventKind::TaskFailed {
            timed_out, attempts, ..
        } => {
            assert!(*timed_out);
            assert_eq!(*attempts, 2);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(orchestrator.system_status().await.metrics.timed_out, 1);
    orchestrator.shutdown().await;
}

/// Test: Timeout enforced without executor cooperation
/// Given an executor that ignores cancellation
/// When its attempt exceeds the timeout
/// Then the attempt is dropped after the cancel grace and the slot frees
#[tokio::test(start_paused = true)]
async fn test_timeout_enforced_on_stubborn_executor() {
    let executor = ScriptedExecutor::new(Duration::from_millis(5));
    executor.set("stubborn", Behavior::Stubborn);
    let mut config = fast_config();
    config.scheduler.max_concurrent_tasks = 1;
    let orchestrator = orchestrator_with_agents(config, executor, 1, 1);
    orchestrator.start().unwrap();

    let stubborn = orchestrator
        .submit_task(
            task("stubborn")
                .with_timeout(Duration::from_millis(50))
                .with_max_retries(0),
        )
        .await
        .unwrap();
    let next = orchestrator.submit_task(task("next")).await.unwrap();

    wait_for_state(&orchestrator, &stubborn, TaskState::TimedOut, LIMIT).await;
    wait_for_state(&orchestrator, &next, TaskState::Completed, LIMIT).await;
    orchestrator.shutdown().await;
}

/// Test: Panicking executor
/// Given an executor that panics for one task
/// When that task runs
/// Then it fails with the panic message and later tasks still run
#[tokio::test(start_paused = true)]
async fn test_panicking_executor_is_contained() {
    let executor = ScriptedExecutor::new(Duration::from_millis(5));
    executor.set("boom", Behavior::Panic);
    let orchestrator = orchestrator_with_agents(fast_config(), executor, 1, 1);
    orchestrator.start().unwrap();

    let boom = orchestrator
        .submit_task(task("boom").with_max_retries(0))
        .await
        .unwrap();
    let status = wait_for_state(&orchestrator, &boom, TaskState::Failed, LIMIT).await;
    assert!(status.reason.unwrap().contains("panicked"));

    let fine = orchestrator.submit_task(task("fine")).await.unwrap();
    wait_for_state(&orchestrator, &fine, TaskState::Completed, LIMIT).await;
    orchestrator.shutdown().await;
}
