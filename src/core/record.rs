//! Append-only log of task attempts.

use crate::agent::AgentId;
use crate::core::task::TaskId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionOutcome {
    /// Failed and timed-out attempts are eligible for retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionOutcome::Failed | ExecutionOutcome::TimedOut)
    }
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionOutcome::Completed => "completed",
            ExecutionOutcome::Failed => "failed",
            ExecutionOutcome::TimedOut => "timed_out",
            ExecutionOutcome::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One attempt of one task on one agent. Never modified once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: ExecutionOutcome,
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Execution records grouped by task.
#[derive(Debug, Default)]
pub struct ExecutionLog {
    records: RwLock<HashMap<TaskId, Vec<ExecutionRecord>>>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: ExecutionRecord) {
        self.records
            .write()
            .entry(record.task_id.clone())
            .or_default()
            .push(record);
    }

    /// Records for a task in the order they were written.
    pub fn for_task(&self, id: &TaskId) -> Vec<ExecutionRecord> {
        self.records.read().get(id).cloned().unwrap_or_default()
    }

    pub fn attempts(&self, id: &TaskId) -> usize {
        self.records.read().get(id).map(Vec::len).unwrap_or(0)
    }

    /// Drop every record of a purged task.
    pub fn purge(&self, id: &TaskId) -> usize {
        self.records
            .write()
            .remove(id)
            .map(|records| records.len())
            .unwrap_or(0)
    }

    /// Total number of records across all tasks.
    pub fn len(&self) -> usize {
        self.records.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
