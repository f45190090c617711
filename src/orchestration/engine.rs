//! Attempt execution under a global concurrency bound.
//!
//! The `ExecutionEngine` owns the semaphore that caps in-flight attempts,
//! the table of running attempts with their cancellation tokens, and the
//! task tracker every worker is spawned on. It runs one attempt at a time
//! per call to [`ExecutionEngine::run_attempt`], enforcing the timeout and
//! the cancel-then-force path independently of executor cooperation.

use crate::agent::{AgentExecutor, AgentId, ExecutionContext, ExecutionError};
use crate::core::record::ExecutionOutcome;
use crate::core::task::TaskId;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Why the orchestrator cancelled a running attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    /// The caller cancelled the task.
    Requested,
    /// The agent was force-unregistered; the task goes back to the queue.
    Reassign,
    /// The orchestrator is shutting down.
    Shutdown,
}

/// How an attempt ended, as seen by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Completed(serde_json::Value),
    Failed(String),
    TimedOut,
    Cancelled,
}

impl AttemptOutcome {
    pub fn as_record_outcome(&self) -> ExecutionOutcome {
        match self {
            AttemptOutcome::Completed(_) => ExecutionOutcome::Completed,
            AttemptOutcome::Failed(_) => ExecutionOutcome::Failed,
            AttemptOutcome::TimedOut => ExecutionOutcome::TimedOut,
            AttemptOutcome::Cancelled => ExecutionOutcome::Cancelled,
        }
    }

    pub fn error(&self) -> Option<String> {
        match self {
            AttemptOutcome::Completed(_) => None,
            AttemptOutcome::Failed(message) => Some(message.clone()),
            AttemptOutcome::TimedOut => Some("attempt timed out".to_string()),
            AttemptOutcome::Cancelled => Some("attempt cancelled".to_string()),
        }
    }
}

/// Everything a worker needs to run one attempt.
#[derive(Clone)]
pub struct AttemptPlan {
    pub task_id: TaskId,
    pub task_name: String,
    pub capability: String,
    pub agent_id: AgentId,
    pub attempt: u32,
    pub payload: serde_json::Value,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    pub executor: Arc<dyn AgentExecutor>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AttemptPlan {
    fn context(&self) -> ExecutionContext {
        ExecutionContext {
            task_id: self.task_id.clone(),
            task_name: self.task_name.clone(),
            capability: self.capability.clone(),
            agent_id: self.agent_id.clone(),
            attempt: self.attempt,
            payload: self.payload.clone(),
            timeout: self.timeout,
            cancel: self.cancel.clone(),
        }
    }
}

impl std::fmt::Debug for AttemptPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptPlan")
            .field("task_id", &self.task_id)
            .field("agent_id", &self.agent_id)
            .field("attempt", &self.attempt)
            .field("timeout", &self.timeout)
            .finish()
    }
}

struct RunningAttempt {
    agent_id: AgentId,
    token: CancellationToken,
    cause: Option<CancelCause>,
}

/// Bounded executor of task attempts.
pub struct ExecutionEngine {
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    running: Mutex<HashMap<TaskId, RunningAttempt>>,
    tracker: TaskTracker,
    default_executor: Arc<dyn AgentExecutor>,
    cancel_grace: Duration,
}

impl ExecutionEngine {
    pub fn new(
        max_concurrent: usize,
        cancel_grace: Duration,
        default_executor: Arc<dyn AgentExecutor>,
    ) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            running: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            default_executor,
            cancel_grace,
        }
    }

    /// Wait for a free concurrency slot.
    pub async fn acquire_slot(&self) -> std::result::Result<OwnedSemaphorePermit, AcquireError> {
        self.slots.clone().acquire_owned().await
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn default_executor(&self) -> Arc<dyn AgentExecutor> {
        self.default_executor.clone()
    }

    /// Spawn a tracked task; shutdown waits for every tracked task.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(future);
    }

    /// Record an attempt as running so it can be cancelled.
    pub fn register(&self, task_id: &TaskId, agent_id: &AgentId, token: CancellationToken) {
        self.running.lock().insert(
            task_id.clone(),
            RunningAttempt {
                agent_id: agent_id.clone(),
                token,
                cause: None,
            },
        );
    }

    /// Forget a finished attempt, returning why it was cancelled, if it was.
    pub fn finish(&self, task_id: &TaskId) -> Option<CancelCause> {
        self.running.lock().remove(task_id).and_then(|r| r.cause)
    }

    /// Signal a running attempt to stop. The first cause wins.
    pub fn cancel(&self, task_id: &TaskId, cause: CancelCause) -> bool {
        let mut running = self.running.lock();
        match running.get_mut(task_id) {
            Some(attempt) => {
                attempt.cause.get_or_insert(cause);
                attempt.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running attempt of one agent. Returns the affected tasks.
    pub fn cancel_agent(&self, agent_id: &AgentId, cause: CancelCause) -> Vec<TaskId> {
        let mut running = self.running.lock();
        running
            .iter_mut()
            .filter(|(_, attempt)| &attempt.agent_id == agent_id)
            .map(|(task_id, attempt)| {
                attempt.cause.get_or_insert(cause);
                attempt.token.cancel();
                task_id.clone()
            })
            .collect()
    }

    /// Cancel everything still running. Returns how many were signalled.
    pub fn cancel_all(&self, cause: CancelCause) -> usize {
        let mut running = self.running.lock();
        for attempt in running.values_mut() {
            attempt.cause.get_or_insert(cause);
            attempt.token.cancel();
        }
        running.len()
    }

    pub fn active_count(&self) -> usize {
        self.running.lock().len()
    }

    pub fn is_running(&self, task_id: &TaskId) -> bool {
        self.running.lock().contains_key(task_id)
    }

    /// Stop treating the tracker as open; `wait` resolves once it drains.
    pub fn close(&self) {
        self.tracker.close();
    }

    /// Wait until every tracked task has finished. Only resolves after `close`.
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }

    /// Run one attempt to completion, timeout, or cancellation.
    ///
    /// On timeout or cancellation the attempt's token is cancelled and the
    /// executor gets the grace period to return; after that its future is
    /// dropped. Panics inside the executor become failures.
    pub async fn run_attempt(&self, plan: &AttemptPlan) -> AttemptOutcome {
        let execution = AssertUnwindSafe(plan.executor.execute(plan.context())).catch_unwind();
        tokio::pin!(execution);
        let deadline = tokio::time::sleep(plan.timeout);
        tokio::pin!(deadline);

        let interrupted = tokio::select! {
            result = &mut execution => {
                return match result {
                    Ok(Ok(output)) => AttemptOutcome::Completed(output),
                    Ok(Err(ExecutionError::Failed(message))) => AttemptOutcome::Failed(message),
                    Ok(Err(ExecutionError::Cancelled)) if plan.cancel.is_cancelled() => {
                        AttemptOutcome::Cancelled
                    }
                    Ok(Err(ExecutionError::Cancelled)) => AttemptOutcome::Failed(
                        "executor reported cancellation that was never requested".to_string(),
                    ),
                    Err(panic) => AttemptOutcome::Failed(format!(
                        "executor panicked: {}",
                        panic_message(panic.as_ref())
                    )),
                };
            }
            _ = &mut deadline => AttemptOutcome::TimedOut,
            _ = plan.cancel.cancelled() => AttemptOutcome::Cancelled,
        };

        plan.cancel.cancel();
        match tokio::time::timeout(self.cancel_grace, &mut execution).await {
            Ok(_) => tracing::debug!(task = %plan.task_id, "executor acknowledged cancellation"),
            Err(_) => tracing::warn!(
                task = %plan.task_id,
                grace_ms = self.cancel_grace.as_millis() as u64,
                "executor ignored cancellation, attempt dropped"
            ),
        }
        interrupted
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("max_concurrent", &self.max_concurrent)
            .field("active", &self.active_count())
            .field("cancel_grace", &self.cancel_grace)
            .finish()
    }
}
