//! Scheduler core: admission, dispatch, and completion bookkeeping.
//!
//! The Scheduler owns the task table and dependency graph (behind one
//! `tokio::sync::RwLock`), the ready queue, and every component the
//! dispatcher needs. A single dispatcher task pops ready work and hands each
//! attempt to a worker spawned on the engine's tracker; workers report back
//! through [`Scheduler::finish_attempt`], which re-feeds dependents,
//! schedules retries, and cascades failures.
//!
//! Lock order is task table first, then queue or registry. The queue and
//! registry locks are `parking_lot` locks and are never held across an
//! `.await`.

use crate::agent::{AgentExecutor, AgentId, AgentSnapshot, AgentSpec};
use crate::config::OrchestratorConfig;
use crate::core::dag::{CompletionEffect, DependencyGraph};
use crate::core::queue::{PriorityQueue, QueueEntry};
use crate::core::record::{ExecutionLog, ExecutionOutcome, ExecutionRecord};
use crate::core::task::{CancelReason, Task, TaskId, TaskSpec, TaskState, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::balancer::{LoadBalancer, LoadBalancingStrategy};
use crate::orchestration::engine::{AttemptOutcome, AttemptPlan, CancelCause, ExecutionEngine};
use crate::orchestration::events::{Event, EventBus, EventKind, SubscriptionId};
use crate::orchestration::metrics::{Metrics, MetricsSnapshot};
use crate::orchestration::priority::{Escalation, PriorityInput, PriorityManager, WeightedRule};
use crate::orchestration::registry::{AgentRegistry, HealthPolicy, Release, Unregistration};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Tasks and the graph over them; always locked together.
#[derive(Debug, Default)]
struct TaskTable {
    tasks: HashMap<TaskId, Task>,
    graph: DependencyGraph,
}

/// Aggregated view of the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub queue_depth: usize,
    pub active_executions: usize,
    pub registered_agents: usize,
    /// Completed over finished tasks; 1.0 before anything finishes.
    pub success_rate: f64,
    pub avg_wait_time: Duration,
    /// Number of known tasks per state name.
    pub task_counts: BTreeMap<String, usize>,
    pub accepting: bool,
    pub metrics: MetricsSnapshot,
}

impl SystemStatus {
    pub fn count(&self, state: TaskState) -> usize {
        self.task_counts.get(state.as_str()).copied().unwrap_or(0)
    }
}

/// What shutdown did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// In-flight attempts all finished within the grace period.
    pub drained: bool,
    /// Attempts still running at the end of the grace period.
    pub forced: usize,
    /// Queued, pending, or waiting-to-retry tasks cancelled.
    pub cancelled: usize,
}

/// Task id, freshly computed score, and the escalation it was computed with.
type RankedTask = (TaskId, f64, Option<Escalation>);

/// Scores computed under the read lock, applied under the write lock.
struct RankPlan {
    now: DateTime<Utc>,
    queued: Vec<RankedTask>,
    waiting: Vec<RankedTask>,
}

enum Dispatch {
    Started,
    Idle(OwnedSemaphorePermit),
}

pub struct Scheduler {
    config: OrchestratorConfig,
    state: RwLock<TaskTable>,
    queue: PriorityQueue,
    registry: Arc<AgentRegistry>,
    balancer: LoadBalancer,
    priority: PriorityManager,
    /// Instant of the last re-rank; time-dependent rules are evaluated
    /// against it between passes.
    rank_clock: Mutex<DateTime<Utc>>,
    engine: ExecutionEngine,
    events: EventBus,
    metrics: Metrics,
    records: ExecutionLog,
    accepting: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    wake: Notify,
}

impl Scheduler {
    pub fn new(
        config: OrchestratorConfig,
        executor: Arc<dyn AgentExecutor>,
        strategy: Box<dyn LoadBalancingStrategy>,
        rules: Option<Vec<WeightedRule>>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(AgentRegistry::new(HealthPolicy::from(&config.agents)));
        let balancer = LoadBalancer::new(registry.clone(), strategy);
        let priority = match rules {
            Some(rules) => PriorityManager::with_rules(&config.priority, rules),
            None => PriorityManager::new(&config.priority),
        };
        let engine = ExecutionEngine::new(
            config.scheduler.max_concurrent_tasks,
            config.scheduler.cancel_grace(),
            executor,
        );

        Ok(Self {
            queue: PriorityQueue::new(config.scheduler.queue_capacity),
            events: EventBus::new(config.events.subscriber_buffer),
            state: RwLock::new(TaskTable::default()),
            registry,
            balancer,
            priority,
            rank_clock: Mutex::new(Utc::now()),
            engine,
            metrics: Metrics::new(),
            records: ExecutionLog::new(),
            accepting: AtomicBool::new(true),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            wake: Notify::new(),
            config,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn publish(&self, kind: EventKind) {
        self.events.publish(kind);
    }

    // Lifecycle

    /// Spawn the dispatcher and maintenance loops.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.engine.spawn(self.clone().run_dispatcher());
        self.engine.spawn(self.clone().run_maintenance());
        tracing::info!(
            max_concurrent = self.config.scheduler.max_concurrent_tasks,
            strategy = self.balancer.strategy_name(),
            "orchestrator started"
        );
        Ok(())
    }

    /// Drain in-flight work, cancel what is left, and stop every loop.
    pub async fn shutdown(self: &Arc<Self>) -> ShutdownReport {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return ShutdownReport {
                drained: true,
                ..ShutdownReport::default()
            };
        }
        self.accepting.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.engine.close();
        tracing::info!(in_flight = self.engine.active_count(), "orchestrator shutting down");

        let grace = self.config.scheduler.shutdown_grace();
        let drained = tokio::time::timeout(grace, self.engine.wait()).await.is_ok();
        let mut forced = 0;
        if !drained {
            forced = self.engine.cancel_all(CancelCause::Shutdown);
            tracing::warn!(forced, "grace period expired, cancelling stragglers");
            // Each straggler gets the cancel grace before its future is dropped.
            let settle = self.config.scheduler.cancel_grace() + Duration::from_millis(100);
            if tokio::time::timeout(settle, self.engine.wait()).await.is_err() {
                tracing::error!("workers did not settle after forced cancellation");
            }
        }

        let mut table = self.state.write().await;
        self.queue.drain();
        let leftover: Vec<TaskId> = table
            .tasks
            .values()
            .filter(|t| !t.state.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        for id in &leftover {
            if let Some(task) = table.tasks.get_mut(id) {
                task.cancel(CancelReason::Shutdown);
            }
            table.graph.on_task_completed(id, false);
            self.note_cancelled(id, CancelReason::Shutdown);
        }
        drop(table);

        let report = ShutdownReport {
            drained,
            forced,
            cancelled: leftover.len(),
        };
        tracing::info!(?report, "orchestrator stopped");
        report
    }

    // Submission

    pub async fn submit_task(&self, spec: TaskSpec) -> Result<TaskId> {
        let mut ids = self.submit_tasks(vec![spec]).await?;
        ids.pop()
            .ok_or_else(|| Error::Validation("empty submission".to_string()))
    }

    /// Admit a batch atomically: either every task is accepted or none is.
    ///
    /// Dependencies may name tasks already known to the orchestrator or
    /// other tasks in the same batch.
    pub async fn submit_tasks(&self, specs: Vec<TaskSpec>) -> Result<Vec<TaskId>> {
        if !self.is_accepting() {
            return Err(Error::ShuttingDown);
        }
        if specs.is_empty() {
            return Ok(Vec::new());
        }

        let mut batch: Vec<(TaskId, TaskSpec)> = Vec::with_capacity(specs.len());
        let mut batch_ids = HashSet::new();
        for spec in specs {
            spec.validate()?;
            let id = spec.id.clone().unwrap_or_else(TaskId::generate);
            if !batch_ids.insert(id.clone()) {
                return Err(Error::DuplicateTaskId(id));
            }
            batch.push((id, spec));
        }

        let mut table = self.state.write().await;
        // Re-check under the lock; shutdown may have started meanwhile.
        if !self.is_accepting() {
            return Err(Error::ShuttingDown);
        }
        for (id, spec) in &batch {
            if table.tasks.contains_key(id) {
                return Err(Error::DuplicateTaskId(id.clone()));
            }
            for dep in &spec.dependencies {
                if !table.tasks.contains_key(dep) && !batch_ids.contains(dep) {
                    return Err(Error::TaskNotFound(dep.clone()));
                }
            }
        }

        let entries: Vec<(TaskId, Vec<TaskId>)> = batch
            .iter()
            .map(|(id, spec)| (id.clone(), spec.dependencies.clone()))
            .collect();
        table.graph.add_batch(&entries)?;

        let ready_now = batch
            .iter()
            .filter(|(id, _)| table.graph.is_ready(id))
            .count();
        if self.queue.len() + ready_now > self.queue.capacity() {
            for (id, _) in &batch {
                table.graph.remove_task(id);
            }
            return Err(Error::QueueFull {
                capacity: self.queue.capacity(),
            });
        }

        let ids: Vec<TaskId> = batch.iter().map(|(id, _)| id.clone()).collect();
        for (id, spec) in batch {
            let mut task = Task::from_spec(id.clone(), spec);
            task.effective_priority = self.score(&task);
            table.tasks.insert(id, task);
        }

        for id in &ids {
            let state = table.tasks.get(id).map(|t| t.state);
            if state != Some(TaskState::Pending) {
                // Already cancelled by a cascade earlier in this loop.
                continue;
            }
            if let Some(dependency) = table.graph.failed_prerequisite(id) {
                let root = Self::failure_root(&table, &dependency);
                self.cancel_with(&mut table, id, CancelReason::DependencyFailed { dependency, root });
            } else if table.graph.is_ready(id) {
                self.make_ready(&mut table, id);
            } else {
                tracing::debug!(task = %id, "task pending on dependencies");
            }
        }
        drop(table);

        tracing::debug!(count = ids.len(), "tasks submitted");
        self.wake.notify_one();
        Ok(ids)
    }

    /// Effective priority as of the last re-rank, or the task's submission
    /// if that is later. A task never ages between re-rank passes, so
    /// equal-priority tasks keep their enqueue order.
    fn score(&self, task: &Task) -> f64 {
        let as_of = task.created_at.max(*self.rank_clock.lock());
        self.priority
            .effective_priority(&PriorityInput::from_task(task), as_of)
    }

    /// Compute effective priority, mark Ready, and enqueue.
    ///
    /// Capacity has already been checked (admission) or does not apply
    /// (re-feeds), so this always uses `force_push`.
    fn make_ready(&self, table: &mut TaskTable, id: &TaskId) {
        let Some(task) = table.tasks.get_mut(id) else {
            return;
        };
        task.effective_priority = self.score(task);
        task.mark_ready();
        let entry = QueueEntry::new(id.clone(), task.effective_priority, &task.capability)
            .with_deadline(task.deadline);
        let priority = entry.priority;
        match self.queue.force_push(entry) {
            Ok(_) => {
                tracing::debug!(task = %id, priority, "task enqueued");
                self.publish(EventKind::TaskEnqueued {
                    task_id: id.clone(),
                    priority,
                });
            }
            Err(err) => tracing::error!(task = %id, error = %err, "failed to enqueue ready task"),
        }
    }

    /// The task whose failure started the chain `failed` belongs to.
    fn failure_root(table: &TaskTable, failed: &TaskId) -> TaskId {
        match table.tasks.get(failed).and_then(|t| t.cancel_reason.as_ref()) {
            Some(CancelReason::DependencyFailed { root, .. }) => root.clone(),
            _ => failed.clone(),
        }
    }

    fn note_cancelled(&self, id: &TaskId, reason: CancelReason) {
        self.metrics.record_terminal(ExecutionOutcome::Cancelled);
        self.priority.clear_escalation(id);
        tracing::debug!(task = %id, %reason, "task cancelled");
        self.publish(EventKind::TaskCancelled {
            task_id: id.clone(),
            reason,
        });
    }

    /// Cancel a non-terminal task and everything downstream of it.
    fn cancel_with(&self, table: &mut TaskTable, id: &TaskId, reason: CancelReason) {
        let Some(task) = table.tasks.get_mut(id) else {
            return;
        };
        if task.state.is_terminal() {
            return;
        }
        let prior = task.state;
        task.cancel(reason.clone());
        match prior {
            TaskState::Ready => {
                self.queue.remove(id);
            }
            TaskState::Assigned | TaskState::Running => {
                self.engine.cancel(id, CancelCause::Requested);
            }
            _ => {}
        }
        self.note_cancelled(id, reason);
        self.cascade_failure(table, id);
    }

    /// Cancel every unresolved transitive dependent of a failed task.
    fn cascade_failure(&self, table: &mut TaskTable, failed: &TaskId) {
        let CompletionEffect::Cancelled(cascades) = table.graph.on_task_completed(failed, false)
        else {
            return;
        };
        if cascades.is_empty() {
            return;
        }
        let root = Self::failure_root(table, failed);
        tracing::info!(root = %root, cancelled = cascades.len(), "dependency failure cascading");
        for cascade in cascades {
            let Some(task) = table.tasks.get_mut(&cascade.task) else {
                continue;
            };
            if task.state.is_terminal() {
                continue;
            }
            if task.state == TaskState::Ready {
                self.queue.remove(&cascade.task);
            }
            let reason = CancelReason::DependencyFailed {
                dependency: cascade.dependency,
                root: root.clone(),
            };
            task.cancel(reason.clone());
            self.note_cancelled(&cascade.task, reason);
        }
    }

    // Caller operations

    /// Cancel a task. Terminal tasks are left alone.
    pub async fn cancel_task(&self, id: &TaskId) -> Result<()> {
        let mut table = self.state.write().await;
        let state = table
            .tasks
            .get(id)
            .map(|t| t.state)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        if state.is_terminal() {
            return Ok(());
        }
        self.cancel_with(&mut table, id, CancelReason::Requested);
        drop(table);
        self.wake.notify_one();
        Ok(())
    }

    pub async fn task_status(&self, id: &TaskId) -> Result<TaskStatus> {
        self.state
            .read()
            .await
            .tasks
            .get(id)
            .map(Task::status)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    /// Boost a task's effective priority until it finishes.
    pub async fn escalate(&self, id: &TaskId, boost: f64, reason: &str) -> Result<()> {
        if !boost.is_finite() {
            return Err(Error::Validation("escalation boost must be finite".to_string()));
        }
        let mut table = self.state.write().await;
        let task = table
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        if task.state.is_terminal() {
            return Err(Error::Validation(format!(
                "task {} already finished ({})",
                id, task.state
            )));
        }
        self.priority.escalate(id, boost, reason);
        task.effective_priority = self.score(task);
        self.queue.update_priority(id, task.effective_priority);
        drop(table);

        self.publish(EventKind::TaskEscalated {
            task_id: id.clone(),
            boost,
            reason: reason.to_string(),
        });
        Ok(())
    }

    pub fn execution_records(&self, id: &TaskId) -> Vec<ExecutionRecord> {
        self.records.for_task(id)
    }

    pub fn register_agent(
        &self,
        spec: AgentSpec,
        executor: Option<Arc<dyn AgentExecutor>>,
    ) -> Result<AgentId> {
        let id = self.registry.register(spec, executor)?;
        self.publish(EventKind::AgentRegistered {
            agent_id: id.clone(),
        });
        self.wake.notify_one();
        Ok(id)
    }

    /// Remove an agent; see [`AgentRegistry::unregister`].
    pub fn unregister_agent(&self, id: &AgentId, force: bool) -> Result<()> {
        match self.registry.unregister(id, force)? {
            Unregistration::Removed => {
                self.publish(EventKind::AgentUnregistered {
                    agent_id: id.clone(),
                });
            }
            Unregistration::Draining { in_flight } => {
                let reassigned = self.engine.cancel_agent(id, CancelCause::Reassign);
                tracing::info!(agent = %id, in_flight, reassigned = reassigned.len(), "reassigning in-flight tasks");
            }
        }
        Ok(())
    }

    pub fn agent(&self, id: &AgentId) -> Option<AgentSnapshot> {
        self.registry.get(id)
    }

    pub fn agents(&self) -> Vec<AgentSnapshot> {
        self.registry.snapshot()
    }

    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.subscribe(topic, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub async fn system_status(&self) -> SystemStatus {
        let table = self.state.read().await;
        let mut task_counts = BTreeMap::new();
        for task in table.tasks.values() {
            *task_counts
                .entry(task.state.as_str().to_string())
                .or_insert(0) += 1;
        }
        drop(table);

        let metrics = self.metrics.snapshot();
        SystemStatus {
            queue_depth: self.queue.len(),
            active_executions: self.engine.active_count(),
            registered_agents: self.registry.len(),
            success_rate: metrics.success_rate,
            avg_wait_time: metrics.avg_wait_time,
            task_counts,
            accepting: self.is_accepting(),
            metrics,
        }
    }

    // Dispatch

    async fn run_dispatcher(self: Arc<Self>) {
        tracing::debug!("dispatcher started");
        let tick = self.config.scheduler.dispatch_tick();
        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.engine.acquire_slot() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::error!("concurrency semaphore closed, dispatcher stopping");
                        break;
                    }
                },
            };

            match self.dispatch_next(permit).await {
                Dispatch::Started => {}
                Dispatch::Idle(permit) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(tick) => {}
                    }
                }
            }
        }
        tracing::debug!("dispatcher stopped");
    }

    /// Pop the best dispatchable task and start it on `permit`.
    ///
    /// Tasks whose capability has no eligible agent stay queued in their
    /// original position; the search moves on to other capabilities.
    async fn dispatch_next(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Dispatch {
        let mut table = self.state.write().await;
        let mut skipped = Vec::new();
        let mut blocked: HashSet<String> = HashSet::new();

        let selected = loop {
            let Some(entry) = self.queue.pop() else {
                break None;
            };
            if blocked.contains(&entry.capability) {
                skipped.push(entry);
                continue;
            }
            let dispatchable = table
                .tasks
                .get(&entry.id)
                .map(|t| t.state == TaskState::Ready)
                .unwrap_or(false);
            if !dispatchable {
                tracing::trace!(task = %entry.id, "dropping stale queue entry");
                continue;
            }
            match self.balancer.select_agent(&entry.capability) {
                Ok(agent) => break Some((entry, agent)),
                Err(_) => {
                    tracing::trace!(capability = %entry.capability, "no eligible agent");
                    blocked.insert(entry.capability.clone());
                    skipped.push(entry);
                }
            }
        };
        for entry in skipped {
            if let Err(err) = self.queue.restore(entry) {
                tracing::error!(error = %err, "failed to restore queue entry");
            }
        }

        let Some((entry, agent_id)) = selected else {
            return Dispatch::Idle(permit);
        };
        let Some(task) = table.tasks.get_mut(&entry.id) else {
            self.registry.record_release(&agent_id);
            return Dispatch::Idle(permit);
        };

        if let Some(enqueued_at) = task.enqueued_at {
            let waited = (Utc::now() - enqueued_at).to_std().unwrap_or_default();
            self.metrics.record_wait(waited);
        }
        task.assign(agent_id.clone());
        task.start();

        let executor = self
            .registry
            .executor(&agent_id)
            .unwrap_or_else(|| self.engine.default_executor());
        let plan = AttemptPlan {
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            capability: task.capability.clone(),
            agent_id: agent_id.clone(),
            attempt: task.attempts,
            payload: task.payload.clone(),
            timeout: task
                .timeout
                .unwrap_or_else(|| self.config.scheduler.default_timeout()),
            cancel: CancellationToken::new(),
            executor,
            started_at: Utc::now(),
        };
        self.engine.register(&plan.task_id, &agent_id, plan.cancel.clone());
        drop(table);

        tracing::debug!(task = %plan.task_id, agent = %agent_id, attempt = plan.attempt, "task started");
        self.publish(EventKind::TaskStarted {
            task_id: plan.task_id.clone(),
            agent_id,
            attempt: plan.attempt,
        });
        self.engine.spawn(self.clone().run_worker(plan, permit));
        Dispatch::Started
    }

    async fn run_worker(self: Arc<Self>, plan: AttemptPlan, permit: OwnedSemaphorePermit) {
        let outcome = self.engine.run_attempt(&plan).await;
        self.finish_attempt(&plan, outcome).await;
        drop(permit);
        self.wake.notify_one();
    }

    /// Bookkeeping for a finished attempt; runs while the slot is still held.
    async fn finish_attempt(self: &Arc<Self>, plan: &AttemptPlan, outcome: AttemptOutcome) {
        let cause = self.engine.finish(&plan.task_id);
        let id = &plan.task_id;

        self.records.append(ExecutionRecord {
            task_id: id.clone(),
            agent_id: plan.agent_id.clone(),
            attempt: plan.attempt,
            started_at: plan.started_at,
            finished_at: Utc::now(),
            outcome: outcome.as_record_outcome(),
            error: outcome.error(),
        });

        let release = match &outcome {
            AttemptOutcome::Completed(_) => self.registry.record_completion(&plan.agent_id, true),
            AttemptOutcome::Failed(_) | AttemptOutcome::TimedOut => {
                self.registry.record_completion(&plan.agent_id, false)
            }
            AttemptOutcome::Cancelled => self.registry.record_release(&plan.agent_id),
        };
        if release == Release::Removed {
            self.publish(EventKind::AgentUnregistered {
                agent_id: plan.agent_id.clone(),
            });
        }

        let mut table = self.state.write().await;
        let Some(task) = table.tasks.get_mut(id) else {
            return;
        };
        if task.state.is_terminal() {
            // Cancelled while running; bookkeeping already done.
            tracing::debug!(task = %id, outcome = %outcome.as_record_outcome(), "attempt ended after cancellation");
            return;
        }

        match outcome {
            AttemptOutcome::Completed(output) => {
                task.complete(output);
                self.metrics.record_terminal(ExecutionOutcome::Completed);
                self.priority.clear_escalation(id);
                tracing::debug!(task = %id, attempt = plan.attempt, "task completed");
                self.publish(EventKind::TaskCompleted {
                    task_id: id.clone(),
                    agent_id: plan.agent_id.clone(),
                    attempt: plan.attempt,
                });
                if let CompletionEffect::Ready(ready) = table.graph.on_task_completed(id, true) {
                    for dependent in ready {
                        self.make_ready(&mut table, &dependent);
                    }
                }
            }
            AttemptOutcome::Failed(_) | AttemptOutcome::TimedOut => {
                let timed_out = outcome == AttemptOutcome::TimedOut;
                let error = outcome.error().unwrap_or_default();
                let budget = task.retry_budget(self.config.retry.max_retries);
                if task.attempts <= budget {
                    let delay = self.config.retry.backoff_for(task.attempts);
                    task.await_retry(&error);
                    self.metrics.record_retry();
                    tracing::info!(task = %id, attempt = plan.attempt, delay_ms = delay.as_millis() as u64, error = %error, "attempt failed, retrying");
                    self.publish(EventKind::TaskRetried {
                        task_id: id.clone(),
                        failed_attempt: plan.attempt,
                        delay,
                        error,
                    });
                    self.schedule_retry(id.clone(), delay);
                } else {
                    let attempts = task.attempts;
                    if timed_out {
                        task.time_out(&error);
                        self.metrics.record_terminal(ExecutionOutcome::TimedOut);
                    } else {
                        task.fail(&error);
                        self.metrics.record_terminal(ExecutionOutcome::Failed);
                    }
                    self.priority.clear_escalation(id);
                    tracing::warn!(task = %id, attempts, error = %error, "task failed, retries exhausted");
                    self.publish(EventKind::TaskFailed {
                        task_id: id.clone(),
                        attempts,
                        error,
                        timed_out,
                    });
                    self.cascade_failure(&mut table, id);
                }
            }
            AttemptOutcome::Cancelled => match cause {
                Some(CancelCause::Reassign) => {
                    task.unassign();
                    tracing::info!(task = %id, agent = %plan.agent_id, "task reassigned");
                    self.make_ready(&mut table, id);
                }
                Some(CancelCause::Shutdown) => {
                    self.cancel_with(&mut table, id, CancelReason::Shutdown);
                }
                Some(CancelCause::Requested) | None => {
                    self.cancel_with(&mut table, id, CancelReason::Requested);
                }
            },
        }
    }

    fn schedule_retry(self: &Arc<Self>, id: TaskId, delay: Duration) {
        let this = self.clone();
        self.engine.spawn(async move {
            tokio::select! {
                _ = this.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let mut table = this.state.write().await;
            let waiting = table
                .tasks
                .get(&id)
                .map(|t| t.state == TaskState::AwaitingRetry)
                .unwrap_or(false);
            if waiting {
                this.make_ready(&mut table, &id);
            }
            drop(table);
            this.wake.notify_one();
        });
    }

    // Maintenance

    async fn run_maintenance(self: Arc<Self>) {
        let mut rerank = tokio::time::interval(self.config.priority.recompute_interval());
        rerank.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut purge = tokio::time::interval(self.config.scheduler.purge_interval());
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = rerank.tick() => {
                    self.rerank().await;
                }
                _ = purge.tick() => {
                    self.purge_expired().await;
                }
            }
        }
        tracing::debug!("maintenance loop stopped");
    }

    /// Recompute effective priorities and re-rank the queue.
    ///
    /// Scores are computed from a copy of the queue under the table read
    /// lock; only changed entries are written back. An entry escalated
    /// while scores were computed is rescored under the write lock instead.
    /// Returns how many queued entries moved.
    pub async fn rerank(&self) -> usize {
        let plan = self.plan_rerank().await;
        self.apply_rerank(plan).await
    }

    async fn plan_rerank(&self) -> RankPlan {
        let table = self.state.read().await;
        // Taken under the table lock so no dispatch has entries popped.
        let snapshot = self.queue.snapshot();
        let now = Utc::now();
        let queued: Vec<RankedTask> = snapshot
            .iter()
            .filter_map(|entry| {
                let task = table.tasks.get(&entry.id)?;
                let score = self
                    .priority
                    .effective_priority(&PriorityInput::from_task(task), now);
                (score != entry.priority).then(|| {
                    (entry.id.clone(), score, self.priority.escalation(&entry.id))
                })
            })
            .collect();
        let waiting: Vec<RankedTask> = table
            .tasks
            .values()
            .filter(|t| matches!(t.state, TaskState::Pending | TaskState::AwaitingRetry))
            .map(|t| {
                let score = self
                    .priority
                    .effective_priority(&PriorityInput::from_task(t), now);
                (t.id.clone(), score, self.priority.escalation(&t.id))
            })
            .collect();
        RankPlan {
            now,
            queued,
            waiting,
        }
    }

    async fn apply_rerank(&self, plan: RankPlan) -> usize {
        let RankPlan {
            now,
            queued,
            waiting,
        } = plan;
        let mut table = self.state.write().await;
        {
            let mut clock = self.rank_clock.lock();
            *clock = (*clock).max(now);
        }
        let mut moved = 0;
        for (id, score, seen) in queued {
            let Some(task) = table.tasks.get_mut(&id) else {
                continue;
            };
            let score = if self.priority.escalation(&id) == seen {
                score
            } else {
                self.score(task)
            };
            if self.queue.update_priority(&id, score) {
                moved += 1;
                task.effective_priority = score;
            }
        }
        for (id, score, seen) in waiting {
            let Some(task) = table.tasks.get_mut(&id) else {
                continue;
            };
            if task.state.is_terminal() {
                continue;
            }
            task.effective_priority = if self.priority.escalation(&id) == seen {
                score
            } else {
                self.score(task)
            };
        }
        tracing::trace!(moved, "priority re-rank");
        moved
    }

    /// Drop terminal tasks older than the retention window, with their
    /// graph nodes and execution records. Returns how many were purged.
    pub async fn purge_expired(&self) -> usize {
        let retention = self.config.scheduler.retention();
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;

        let mut table = self.state.write().await;
        let expired: Vec<TaskId> = table
            .tasks
            .values()
            .filter(|t| t.state.is_terminal())
            .filter(|t| t.finished_at.map(|at| at <= cutoff).unwrap_or(false))
            .map(|t| t.id.clone())
            .collect();
        for id in &expired {
            table.tasks.remove(id);
            table.graph.remove_task(id);
            self.records.purge(id);
        }
        if !expired.is_empty() {
            tracing::debug!(purged = expired.len(), "purged expired tasks");
        }
        expired.len()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("queue", &self.queue.len())
            .field("engine", &self.engine)
            .field("registry", &self.registry)
            .field("accepting", &self.is_accepting())
            .finish()
    }
}
