//! Agent data model and the executor contract.
//!
//! An agent is a unit of execution capacity advertising a set of
//! capabilities. The orchestrator never knows what an agent does; it hands
//! each attempt to an [`AgentExecutor`] and waits for a result value or an
//! [`ExecutionError`].

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique identifier for an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn generate() -> Self {
        Self(format!("agent-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An agent registration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    #[serde(default)]
    pub id: Option<AgentId>,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_max_concurrent() -> usize {
    1
}

impl AgentSpec {
    pub fn new<I, S>(name: &str, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: None,
            name: name.to_string(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            max_concurrent: default_max_concurrent(),
        }
    }

    pub fn with_id(mut self, id: impl Into<AgentId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("agent name must not be empty".to_string()));
        }
        if self.capabilities.is_empty() || self.capabilities.iter().any(|c| c.trim().is_empty())
        {
            return Err(Error::Validation(format!(
                "agent '{}' must advertise at least one non-empty capability",
                self.name
            )));
        }
        if self.max_concurrent == 0 {
            return Err(Error::Validation(format!(
                "agent '{}' must accept at least one concurrent task",
                self.name
            )));
        }
        if let Some(id) = &self.id {
            if id.as_str().trim().is_empty() {
                return Err(Error::Validation("agent id must not be empty".to_string()));
            }
        }
        Ok(())
    }
}

/// Health of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    /// No in-flight work.
    Idle,
    /// Running at least one attempt, possibly with spare capacity.
    Busy,
    /// Too many consecutive failures; waiting out the cool-down.
    Error,
    /// Draining before removal.
    Unavailable,
}

impl std::fmt::Display for AgentHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentHealth::Idle => "idle",
            AgentHealth::Busy => "busy",
            AgentHealth::Error => "error",
            AgentHealth::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub max_concurrent: usize,
    pub load: usize,
    /// Exponential moving average of attempt outcomes, starting at 1.0.
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub health: AgentHealth,
    pub total_completed: u64,
    pub total_failed: u64,
    pub registered_at: DateTime<Utc>,
    /// Whether the agent can take new work right now.
    pub eligible: bool,
}

impl AgentSnapshot {
    /// Fraction of capacity in use, in `[0, 1]`.
    pub fn load_ratio(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 1.0;
        }
        self.load as f64 / self.max_concurrent as f64
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Everything an executor needs to run one attempt of a task.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: TaskId,
    pub task_name: String,
    pub capability: String,
    pub agent_id: AgentId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub payload: serde_json::Value,
    pub timeout: Duration,
    /// Cancelled on timeout, task cancellation, or shutdown. Executors must
    /// poll it and return promptly once it fires.
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Failure reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    /// The executor observed its cancellation token and stopped.
    #[error("execution cancelled")]
    Cancelled,
}

pub type ExecutionResult = std::result::Result<serde_json::Value, ExecutionError>;

/// Runs task attempts on behalf of agents.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext) -> ExecutionResult;
}

/// Adapts an async closure into an [`AgentExecutor`].
pub struct FnExecutor<F> {
    f: F,
}

impl<F, Fut> FnExecutor<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecutionResult> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> AgentExecutor for FnExecutor<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecutionResult> + Send + 'static,
{
    async fn execute(&self, ctx: ExecutionContext) -> ExecutionResult {
        (self.f)(ctx).await
    }
}
