//! Agent lifecycle integration tests.
//!
//! These tests verify unregistration, forced reassignment, health tracking,
//! and how the balancing strategies spread work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agentflow::orchestration::topics;
use agentflow::{
    AgentHealth, AgentId, AgentSpec, Error, ExecutionError, FnExecutor, Orchestrator, StrategyKind,
    TaskSpec, TaskState,
};

use crate::fixtures::{
    fast_config, orchestrator_with_agents, wait_for_state, wait_terminal, Behavior, EventLog,
    ScriptedExecutor, CAPABILITY,
};

const LIMIT: Duration = Duration::from_secs(30);

fn task(id: &str) -> TaskSpec {
    TaskSpec::new(id, CAPABILITY).with_id(id)
}

/// Test: Unregister an idle agent
/// Given a registered agent with no work
/// When it is unregistered
/// Then it disappears and an agent.unregistered event is published
#[tokio::test]
async fn test_unregister_idle_agent() {
    let executor = ScriptedExecutor::new(Duration::from_millis(1));
    let orchestrator = orchestrator_with_agents(fast_config(), executor, 0, 1);
    let (events, _) = EventLog::subscribe(&orchestrator, "*");

    let id = orchestrator
        .register_agent(AgentSpec::new("idle", [CAPABILITY]))
        .unwrap();
    assert!(id.as_str().starts_with("agent-"));
    assert_eq!(orchestrator.system_status().await.registered_agents, 1);

    orchestrator.unregister_agent(&id, false).unwrap();
    assert!(orchestrator.agent(&id).is_none());
    assert!(matches!(
        orchestrator.unregister_agent(&id, false).unwrap_err(),
        Error::AgentNotFound(_)
    ));

    events
        .wait_for_count(topics::AGENT_UNREGISTERED, 1, LIMIT)
        .await;
    assert_eq!(
        events.topics(),
        vec![topics::AGENT_REGISTERED, topics::AGENT_UNREGISTERED]
    );
}

/// Test: Duplicate agent ids are rejected
#[tokio::test]
async fn test_duplicate_agent_id() {
    let executor = ScriptedExecutor::new(Duration::from_millis(1));
    let orchestrator = orchestrator_with_agents(fast_config(), executor, 1, 1);
    let err = orchestrator
        .register_agent(AgentSpec::new("again", [CAPABILITY]).with_id("agent-0"))
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateAgentId(_)));
}

/// Test: Unregister a busy agent without force
/// Given an agent running a task
/// When it is unregistered without force
/// Then the call fails with AgentBusy, the agent takes no new work, and it
/// leaves once the running task finishes
#[tokio::test]
async fn test_unregister_busy_agent_drains() {
    let executor = ScriptedExecutor::new(Duration::from_millis(100));
    let orchestrator = orchestrator_with_agents(fast_config(), executor, 1, 2);
    let (events, _) = EventLog::subscribe(&orchestrator, topics::AGENT_UNREGISTERED);
    orchestrator.start().unwrap();

    let first = orchestrator.submit_task(task("first")).await.unwrap();
    wait_for_state(&orchestrator, &first, TaskState::Running, LIMIT).await;

    let agent = AgentId::from("agent-0");
    let err = orchestrator.unregister_agent(&agent, false).unwrap_err();
    assert!(matches!(err, Error::AgentBusy { in_flight: 1, .. }));
    let snapshot = orchestrator.agent(&agent).unwrap();
    assert_eq!(snapshot.health, AgentHealth::Unavailable);
    assert!(!snapshot.eligible);

    let second = orchestrator.submit_task(task("second")).await.unwrap();
    wait_for_state(&orchestrator, &first, TaskState::Completed, LIMIT).await;
    events
        .wait_for_count(topics::AGENT_UNREGISTERED, 1, LIMIT)
        .await;
    assert!(orchestrator.agent(&agent).is_none());
    assert_eq!(
        orchestrator.task_status(&second).await.unwrap().state,
        TaskState::Ready
    );
    orchestrator.shutdown().await;
}

/// Test: Forced unregister reassigns in-flight work
/// Given a task running on an agent that only stops when cancelled
/// When that agent is force-unregistered while another agent is available
/// Then the task moves to the other agent and completes without using up a retry
#[tokio::test]
async fn test_force_unregister_reassigns() {
    let executor = Arc::new(FnExecutor::new(|ctx| async move {
        if ctx.agent_id.as_str() == "doomed" {
            ctx.cancel.cancelled().await;
            return Err(ExecutionError::Cancelled);
        }
        Ok(serde_json::json!(ctx.agent_id.to_string()))
    }));
    let orchestrator = Orchestrator::new(fast_config(), executor).unwrap();
    let (events, _) = EventLog::subscribe(&orchestrator, topics::AGENT_UNREGISTERED);
    let doomed = orchestrator
        .register_agent(AgentSpec::new("doomed", [CAPABILITY]).with_id("doomed"))
        .unwrap();
    orchestrator.start().unwrap();

    let id = orchestrator
        .submit_task(task("moving").with_max_retries(0))
        .await
        .unwrap();
    let running = wait_for_state(&orchestrator, &id, TaskState::Running, LIMIT).await;
    assert_eq!(running.agent_id, Some(doomed.clone()));

    orchestrator
        .register_agent(AgentSpec::new("rescuer", [CAPABILITY]).with_id("rescuer"))
        .unwrap();
    orchestrator.unregister_agent(&doomed, true).unwrap();

    let status = wait_for_state(&orchestrator, &id, TaskState::Completed, LIMIT).await;
    assert_eq!(status.output, Some(serde_json::json!("rescuer")));
    assert_eq!(status.attempts, 1);
    assert_eq!(status.agent_id, Some(AgentId::from("rescuer")));

    events
        .wait_for_count(topics::AGENT_UNREGISTERED, 1, LIMIT)
        .await;
    assert!(orchestrator.agent(&doomed).is_none());
    orchestrator.shutdown().await;
}

/// Test: Agent health after repeated failures
/// Given a failure threshold of 2 and a long cool-down
/// When an agent fails two attempts in a row
/// Then it is marked Error and work goes to a healthy agent
#[tokio::test]
async fn test_failing_agent_marked_unhealthy() {
    let executor = Arc::new(FnExecutor::new(|ctx| async move {
        if ctx.agent_id.as_str() == "flaky" {
            return Err(ExecutionError::Failed("flaky agent".to_string()));
        }
        Ok(serde_json::Value::Null)
    }));
    let mut config = fast_config();
    config.agents.failure_threshold = 2;
    config.agents.cooldown_ms = 3_600_000;
    let orchestrator = Orchestrator::new(config, executor).unwrap();
    let flaky = orchestrator
        .register_agent(AgentSpec::new("flaky", [CAPABILITY]).with_id("flaky"))
        .unwrap();
    orchestrator.start().unwrap();

    let ids = orchestrator
        .submit_tasks(vec![task("f1").with_max_retries(0), task("f2").with_max_retries(0)])
        .await
        .unwrap();
    wait_terminal(&orchestrator, &ids, LIMIT).await;

    let snapshot = orchestrator.agent(&flaky).unwrap();
    assert_eq!(snapshot.health, AgentHealth::Error);
    assert_eq!(snapshot.consecutive_failures, 2);
    assert_eq!(snapshot.total_failed, 2);
    assert!(snapshot.success_rate < 1.0);
    assert!(!snapshot.eligible);

    orchestrator
        .register_agent(AgentSpec::new("steady", [CAPABILITY]).with_id("steady"))
        .unwrap();
    let next = orchestrator.submit_task(task("next")).await.unwrap();
    let status = wait_for_state(&orchestrator, &next, TaskState::Completed, LIMIT).await;
    assert_eq!(status.agent_id, Some(AgentId::from("steady")));
    orchestrator.shutdown().await;
}

/// Test: Round-robin spreads sequential work evenly
/// Given three agents and the round-robin strategy
/// When nine tasks run one at a time
/// Then each agent runs exactly three
#[tokio::test]
async fn test_round_robin_distribution() {
    let executor = ScriptedExecutor::new(Duration::from_millis(1));
    let mut config = fast_config();
    config.scheduler.max_concurrent_tasks = 1;
    config.agents.strategy = StrategyKind::RoundRobin;
    let orchestrator = orchestrator_with_agents(config, executor.clone(), 3, 1);
    orchestrator.start().unwrap();

    let ids = orchestrator
        .submit_tasks((0..9).map(|i| task(&format!("rr-{}", i))).collect())
        .await
        .unwrap();
    wait_terminal(&orchestrator, &ids, LIMIT).await;

    let mut per_agent: HashMap<String, usize> = HashMap::new();
    for attempt in executor.attempts() {
        *per_agent.entry(attempt.agent_id).or_insert(0) += 1;
    }
    assert_eq!(per_agent.len(), 3);
    assert!(per_agent.values().all(|&n| n == 3), "{:?}", per_agent);
    orchestrator.shutdown().await;
}

/// Test: Least-loaded keeps concurrent work spread out
/// Given two agents with capacity 4 and the least-loaded strategy
/// When four long tasks start together
/// Then each agent runs two of them
#[tokio::test]
async fn test_least_loaded_spreads_concurrent_work() {
    let executor = ScriptedExecutor::with_default(Duration::ZERO, Behavior::Block);
    let mut config = fast_config();
    config.agents.strategy = StrategyKind::LeastLoaded;
    let orchestrator = orchestrator_with_agents(config, executor.clone(), 2, 4);
    orchestrator.start().unwrap();

    let ids = orchestrator
        .submit_tasks((0..4).map(|i| task(&format!("ll-{}", i))).collect())
        .await
        .unwrap();
    for id in &ids {
        wait_for_state(&orchestrator, id, TaskState::Running, LIMIT).await;
    }

    for agent in ["agent-0", "agent-1"] {
        assert_eq!(orchestrator.agent(&AgentId::from(agent)).unwrap().load, 2);
    }
    for id in &ids {
        orchestrator.cancel_task(id).await.unwrap();
    }
    orchestrator.shutdown().await;
    assert_eq!(executor.attempts().len(), 4);
}
