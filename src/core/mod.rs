//! Core domain models for the orchestrator.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration layer: tasks, the dependency graph, the ready queue,
//! and the execution log.

pub mod dag;
pub mod queue;
pub mod record;
pub mod task;

pub use dag::{Cascade, CompletionEffect, DependencyGraph, Resolution};
pub use queue::{PriorityQueue, QueueEntry};
pub use record::{ExecutionLog, ExecutionOutcome, ExecutionRecord};
pub use task::{CancelReason, Priority, Task, TaskId, TaskSpec, TaskState, TaskStatus};
