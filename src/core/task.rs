//! Task data model for the orchestrator.
//!
//! Tasks are the atomic units of work matched to agents. A [`TaskSpec`] is
//! what callers submit; the orchestrator turns it into a [`Task`] whose state
//! it owns exclusively. Callers observe tasks through [`TaskStatus`].

use crate::agent::AgentId;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a task.
///
/// Callers may supply their own identifier; otherwise one is generated
/// from a UUID v4.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a new unique task identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Return at most the first 8 characters for display.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Base priority of a task.
///
/// The named levels map onto fixed scores; `Score` lets callers pick any
/// point on the same scale. The base priority never changes after
/// submission; effective priority is derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
    Critical,
    Score(f64),
}

impl Priority {
    /// Numeric score used as the base of effective priority.
    pub fn base_score(&self) -> f64 {
        match self {
            Priority::Low => 10.0,
            Priority::Normal => 20.0,
            Priority::High => 30.0,
            Priority::Urgent => 40.0,
            Priority::Critical => 50.0,
            Priority::Score(score) => *score,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
            Priority::Critical => write!(f, "critical"),
            Priority::Score(score) => write!(f, "score({})", score),
        }
    }
}

/// Task state in its lifecycle.
///
/// `Pending -> Ready -> Assigned -> Running -> {Completed | Failed |
/// Cancelled | TimedOut}`. A failed attempt with retries left passes through
/// `AwaitingRetry` on its way back to `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting on unsatisfied dependencies.
    Pending,
    /// All dependencies satisfied; sitting in the priority queue.
    Ready,
    /// Popped from the queue with an agent chosen.
    Assigned,
    /// Dispatched to the agent.
    Running,
    /// Last attempt failed; waiting out the retry backoff.
    AwaitingRetry,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskState {
    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled | TaskState::TimedOut
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Assigned => "assigned",
            TaskState::Running => "running",
            TaskState::AwaitingRetry => "awaiting_retry",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task ended up cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum CancelReason {
    /// A caller asked for it.
    Requested,
    /// A prerequisite failed. `dependency` is the direct prerequisite that
    /// cancelled this task, `root` the task whose failure started the chain.
    DependencyFailed { dependency: TaskId, root: TaskId },
    /// The orchestrator shut down before the task could finish.
    Shutdown,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Requested => write!(f, "cancelled by request"),
            CancelReason::DependencyFailed { dependency, root } if dependency == root => {
                write!(f, "dependency failed: {}", dependency)
            }
            CancelReason::DependencyFailed { dependency, root } => {
                write!(f, "dependency failed: {} (root: {})", dependency, root)
            }
            CancelReason::Shutdown => write!(f, "orchestrator shutdown"),
        }
    }
}

/// A task submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Caller-supplied id; generated when absent.
    #[serde(default)]
    pub id: Option<TaskId>,
    pub name: String,
    #[serde(default)]
    pub priority: Priority,
    /// Capability an agent must advertise to run this task.
    pub capability: String,
    /// Opaque input handed to the agent.
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub estimated_duration: Option<Duration>,
    /// Per-attempt timeout; the configured default applies when absent.
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Free-form metadata read by priority rules.
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Overrides the configured retry budget for this task.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl TaskSpec {
    pub fn new(name: &str, capability: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            priority: Priority::Normal,
            capability: capability.to_string(),
            payload: serde_json::Value::Null,
            estimated_duration: None,
            timeout: None,
            deadline: None,
            context: HashMap::new(),
            dependencies: Vec::new(),
            max_retries: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_estimated_duration(mut self, estimate: Duration) -> Self {
        self.estimated_duration = Some(estimate);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_context(mut self, key: &str, value: serde_json::Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Check the fields that do not depend on orchestrator state.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("task name must not be empty".to_string()));
        }
        if self.capability.trim().is_empty() {
            return Err(Error::Validation(format!(
                "task '{}' has no required capability",
                self.name
            )));
        }
        if let Some(id) = &self.id {
            if id.as_str().trim().is_empty() {
                return Err(Error::Validation("task id must not be empty".to_string()));
            }
            if self.dependencies.contains(id) {
                return Err(Error::CycleDetected {
                    task: id.clone(),
                    depends_on: id.clone(),
                });
            }
        }
        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(Error::Validation(format!(
                    "task '{}' has a zero timeout",
                    self.name
                )));
            }
        }
        if let Priority::Score(score) = self.priority {
            if !score.is_finite() {
                return Err(Error::Validation(format!(
                    "task '{}' has a non-finite priority score",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// A task owned by the orchestrator.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub capability: String,
    /// Immutable base priority.
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub estimated_duration: Option<Duration>,
    pub timeout: Option<Duration>,
    pub deadline: Option<DateTime<Utc>>,
    pub context: HashMap<String, serde_json::Value>,
    pub dependencies: Vec<TaskId>,
    pub max_retries: Option<u32>,
    pub state: TaskState,
    /// Failure detail of the last attempt, or the terminal failure.
    pub error: Option<String>,
    pub cancel_reason: Option<CancelReason>,
    /// Number of attempts started so far.
    pub attempts: u32,
    pub agent_id: Option<AgentId>,
    /// Last computed effective priority.
    pub effective_priority: f64,
    pub created_at: DateTime<Utc>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
}

impl Task {
    /// Build a task from a validated spec. The id must already be resolved.
    pub fn from_spec(id: TaskId, spec: TaskSpec) -> Self {
        let effective_priority = spec.priority.base_score();
        Self {
            id,
            name: spec.name,
            capability: spec.capability,
            priority: spec.priority,
            payload: spec.payload,
            estimated_duration: spec.estimated_duration,
            timeout: spec.timeout,
            deadline: spec.deadline,
            context: spec.context,
            dependencies: spec.dependencies,
            max_retries: spec.max_retries,
            state: TaskState::Pending,
            error: None,
            cancel_reason: None,
            attempts: 0,
            agent_id: None,
            effective_priority,
            created_at: Utc::now(),
            enqueued_at: None,
            started_at: None,
            finished_at: None,
            output: None,
        }
    }

    /// Task entered the priority queue.
    pub fn mark_ready(&mut self) {
        self.state = TaskState::Ready;
        self.enqueued_at = Some(Utc::now());
    }

    /// Task was popped and matched with an agent; starts a new attempt.
    pub fn assign(&mut self, agent_id: AgentId) {
        self.state = TaskState::Assigned;
        self.agent_id = Some(agent_id);
        self.attempts += 1;
    }

    /// Attempt handed to the agent.
    pub fn start(&mut self) {
        self.state = TaskState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, output: serde_json::Value) {
        self.state = TaskState::Completed;
        self.output = Some(output);
        self.error = None;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str) {
        self.state = TaskState::Failed;
        self.error = Some(error.to_string());
        self.finished_at = Some(Utc::now());
    }

    pub fn time_out(&mut self, error: &str) {
        self.state = TaskState::TimedOut;
        self.error = Some(error.to_string());
        self.finished_at = Some(Utc::now());
    }

    pub fn cancel(&mut self, reason: CancelReason) {
        self.state = TaskState::Cancelled;
        self.cancel_reason = Some(reason);
        self.finished_at = Some(Utc::now());
    }

    /// Attempt failed but the retry budget is not exhausted yet.
    pub fn await_retry(&mut self, error: &str) {
        self.state = TaskState::AwaitingRetry;
        self.error = Some(error.to_string());
        self.agent_id = None;
    }

    /// Undo an assignment that never ran (agent reassignment).
    pub fn unassign(&mut self) {
        self.attempts = self.attempts.saturating_sub(1);
        self.agent_id = None;
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Retry budget for this task given the configured default.
    pub fn retry_budget(&self, default: u32) -> u32 {
        self.max_retries.unwrap_or(default)
    }

    /// Read-only view handed to callers.
    pub fn status(&self) -> TaskStatus {
        let reason = match (&self.cancel_reason, &self.error) {
            (Some(cancel), _) => Some(cancel.to_string()),
            (None, Some(error)) => Some(error.clone()),
            (None, None) => None,
        };
        TaskStatus {
            id: self.id.clone(),
            name: self.name.clone(),
            capability: self.capability.clone(),
            state: self.state,
            reason,
            cancel_reason: self.cancel_reason.clone(),
            priority: self.priority,
            effective_priority: self.effective_priority,
            attempts: self.attempts,
            agent_id: self.agent_id.clone(),
            created_at: self.created_at,
            enqueued_at: self.enqueued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            output: self.output.clone(),
        }
    }
}

/// Snapshot of a task's progress as reported to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: TaskId,
    pub name: String,
    pub capability: String,
    pub state: TaskState,
    /// Human-readable failure or cancellation detail.
    pub reason: Option<String>,
    pub cancel_reason: Option<CancelReason>,
    pub priority: Priority,
    pub effective_priority: f64,
    pub attempts: u32,
    pub agent_id: Option<AgentId>,
    pub created_at: DateTime<Utc>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
}
