//! Orchestrator-wide counters.

use crate::core::record::ExecutionOutcome;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free outcome and wait-time counters.
#[derive(Debug, Default)]
pub struct Metrics {
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    retries: AtomicU64,
    dispatched: AtomicU64,
    wait_micros: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a terminal task outcome.
    pub fn record_terminal(&self, outcome: ExecutionOutcome) {
        let counter = match outcome {
            ExecutionOutcome::Completed => &self.completed,
            ExecutionOutcome::Failed => &self.failed,
            ExecutionOutcome::TimedOut => &self.timed_out,
            ExecutionOutcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Time a task spent queued before this dispatch.
    pub fn record_wait(&self, wait: Duration) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.wait_micros
            .fetch_add(wait.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let timed_out = self.timed_out.load(Ordering::Relaxed);
        let dispatched = self.dispatched.load(Ordering::Relaxed);
        let wait_micros = self.wait_micros.load(Ordering::Relaxed);

        let finished = completed + failed + timed_out;
        let success_rate = if finished == 0 {
            1.0
        } else {
            completed as f64 / finished as f64
        };
        let avg_wait_time = if dispatched == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(wait_micros / dispatched)
        };

        MetricsSnapshot {
            completed,
            failed,
            timed_out,
            cancelled: self.cancelled.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dispatched,
            success_rate,
            avg_wait_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub retries: u64,
    /// Attempts handed to agents, retries included.
    pub dispatched: u64,
    /// Completed over finished tasks (cancellations excluded); 1.0 when
    /// nothing has finished yet.
    pub success_rate: f64,
    pub avg_wait_time: Duration,
}
