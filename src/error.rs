use thiserror::Error;

use crate::agent::AgentId;
use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate task id: {0}")]
    DuplicateTaskId(TaskId),

    #[error("Duplicate agent id: {0}")]
    DuplicateAgentId(AgentId),

    #[error("Dependency cycle detected: {task} -> {depends_on}")]
    CycleDetected { task: TaskId, depends_on: TaskId },

    #[error("Task queue is full (capacity: {capacity})")]
    QueueFull { capacity: usize },

    #[error("No eligible agent for capability: {capability}")]
    NoEligibleAgent { capability: String },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Agent {id} still has {in_flight} in-flight task(s)")]
    AgentBusy { id: AgentId, in_flight: usize },

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, Error>;
