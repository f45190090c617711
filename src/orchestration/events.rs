//! Lifecycle event bus.
//!
//! Every subscriber owns a bounded channel drained by its own tokio task,
//! so a slow or panicking handler never blocks the publisher or other
//! subscribers. When a subscriber's channel is full the event is dropped
//! for that subscriber only.

use crate::agent::AgentId;
use crate::core::task::{CancelReason, TaskId};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod topics {
    pub const TASK_ENQUEUED: &str = "task.enqueued";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_RETRIED: &str = "task.retried";
    pub const TASK_CANCELLED: &str = "task.cancelled";
    pub const TASK_ESCALATED: &str = "task.escalated";
    pub const AGENT_REGISTERED: &str = "agent.registered";
    pub const AGENT_UNREGISTERED: &str = "agent.unregistered";
    /// Subscribes to every topic.
    pub const ALL: &str = "*";

    pub const KNOWN: [&str; 9] = [
        TASK_ENQUEUED,
        TASK_STARTED,
        TASK_COMPLETED,
        TASK_FAILED,
        TASK_RETRIED,
        TASK_CANCELLED,
        TASK_ESCALATED,
        AGENT_REGISTERED,
        AGENT_UNREGISTERED,
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EventKind {
    TaskEnqueued {
        task_id: TaskId,
        priority: f64,
    },
    TaskStarted {
        task_id: TaskId,
        agent_id: AgentId,
        attempt: u32,
    },
    TaskCompleted {
        task_id: TaskId,
        agent_id: AgentId,
        attempt: u32,
    },
    /// Terminal failure after the retry budget ran out.
    TaskFailed {
        task_id: TaskId,
        attempts: u32,
        error: String,
        timed_out: bool,
    },
    TaskRetried {
        task_id: TaskId,
        /// The attempt that just failed.
        failed_attempt: u32,
        delay: Duration,
        error: String,
    },
    TaskCancelled {
        task_id: TaskId,
        reason: CancelReason,
    },
    TaskEscalated {
        task_id: TaskId,
        boost: f64,
        reason: String,
    },
    AgentRegistered {
        agent_id: AgentId,
    },
    AgentUnregistered {
        agent_id: AgentId,
    },
}

impl EventKind {
    pub fn topic(&self) -> &'static str {
        match self {
            EventKind::TaskEnqueued { .. } => topics::TASK_ENQUEUED,
            EventKind::TaskStarted { .. } => topics::TASK_STARTED,
            EventKind::TaskCompleted { .. } => topics::TASK_COMPLETED,
            EventKind::TaskFailed { .. } => topics::TASK_FAILED,
            EventKind::TaskRetried { .. } => topics::TASK_RETRIED,
            EventKind::TaskCancelled { .. } => topics::TASK_CANCELLED,
            EventKind::TaskEscalated { .. } => topics::TASK_ESCALATED,
            EventKind::AgentRegistered { .. } => topics::AGENT_REGISTERED,
            EventKind::AgentUnregistered { .. } => topics::AGENT_UNREGISTERED,
        }
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            EventKind::TaskEnqueued { task_id, .. }
            | EventKind::TaskStarted { task_id, .. }
            | EventKind::TaskCompleted { task_id, .. }
            | EventKind::TaskFailed { task_id, .. }
            | EventKind::TaskRetried { task_id, .. }
            | EventKind::TaskCancelled { task_id, .. }
            | EventKind::TaskEscalated { task_id, .. } => Some(task_id),
            EventKind::AgentRegistered { .. } | EventKind::AgentUnregistered { .. } => None,
        }
    }
}

/// A published event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            at: Utc::now(),
            kind,
        }
    }

    pub fn topic(&self) -> &'static str {
        self.kind.topic()
    }
}

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Subscriber {
    topic: String,
    tx: mpsc::Sender<Arc<Event>>,
}

impl Subscriber {
    fn wants(&self, topic: &str) -> bool {
        self.topic == topics::ALL || self.topic == topic
    }
}

/// Publish/subscribe hub for lifecycle events.
pub struct EventBus {
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register `handler` for `topic` (or `"*"`).
    ///
    /// Must be called inside a tokio runtime; the handler runs on a task
    /// spawned here.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        if topic != topics::ALL && !topics::KNOWN.contains(&topic) {
            return Err(Error::Validation(format!("unknown event topic: {}", topic)));
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, mut rx) = mpsc::channel::<Arc<Event>>(self.buffer);
        let handler: EventHandler = Arc::new(handler);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&event)));
                if result.is_err() {
                    tracing::error!(subscription = %id, topic = event.topic(), "event handler panicked");
                }
            }
            tracing::trace!(subscription = %id, "subscriber finished");
        });

        self.subscribers.write().insert(
            id,
            Subscriber {
                topic: topic.to_string(),
                tx,
            },
        );
        tracing::debug!(subscription = %id, topic, "subscribed");
        Ok(id)
    }

    /// Stop delivering to a subscription. Events already queued for it are
    /// still handled.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.subscribers.write().remove(&id).is_some();
        if removed {
            tracing::debug!(subscription = %id, "unsubscribed");
        }
        removed
    }

    /// Fan an event out to matching subscribers without waiting.
    pub fn publish(&self, kind: EventKind) {
        let event = Arc::new(Event::new(kind));
        let topic = event.topic();
        let subscribers = self.subscribers.read();
        for (id, subscriber) in subscribers.iter().filter(|(_, s)| s.wants(topic)) {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(subscription = %id, topic, "subscriber lagging, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::trace!(subscription = %id, topic, "subscriber closed");
                }
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Events dropped because a subscriber's channel was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.subscribers.write().clear();
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("buffer", &self.buffer)
            .finish()
    }
}
