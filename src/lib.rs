pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;

pub use agent::{
    AgentExecutor, AgentHealth, AgentId, AgentSnapshot, AgentSpec, ExecutionContext,
    ExecutionError, ExecutionResult, FnExecutor,
};
pub use config::OrchestratorConfig;
pub use core::{CancelReason, Priority, TaskId, TaskSpec, TaskState, TaskStatus};
pub use error::{Error, Result};
pub use orchestration::{Orchestrator, ShutdownReport, StrategyKind, SystemStatus};
