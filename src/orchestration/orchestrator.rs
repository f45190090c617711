//! Public entry point tying the scheduler, registry, and event bus together.

use crate::agent::{AgentExecutor, AgentId, AgentSnapshot, AgentSpec};
use crate::config::OrchestratorConfig;
use crate::core::record::ExecutionRecord;
use crate::core::task::{TaskId, TaskSpec, TaskStatus};
use crate::error::Result;
use crate::orchestration::balancer::LoadBalancingStrategy;
use crate::orchestration::events::{Event, SubscriptionId};
use crate::orchestration::priority::WeightedRule;
use crate::orchestration::scheduler::{Scheduler, ShutdownReport, SystemStatus};
use std::sync::Arc;

/// In-process task orchestrator.
///
/// Cheap to clone; clones share the same scheduler.
///
/// ```ignore
/// let orchestrator = Orchestrator::new(OrchestratorConfig::default(), executor)?;
/// orchestrator.register_agent(AgentSpec::new("worker", ["build"]))?;
/// orchestrator.start()?;
/// let id = orchestrator.submit_task(TaskSpec::new("compile", "build")).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Orchestrator {
    scheduler: Arc<Scheduler>,
}

impl Orchestrator {
    /// Create an orchestrator using the configured strategy and the built-in
    /// priority rules. `executor` runs tasks for agents registered without
    /// their own executor.
    pub fn new(config: OrchestratorConfig, executor: Arc<dyn AgentExecutor>) -> Result<Self> {
        let strategy = config.agents.strategy.build();
        let scheduler = Scheduler::new(config, executor, strategy, None)?;
        Ok(Self {
            scheduler: Arc::new(scheduler),
        })
    }

    /// Create an orchestrator with a custom balancing strategy and priority
    /// rule table. Manual escalation is always added to `rules`.
    pub fn with_components(
        config: OrchestratorConfig,
        executor: Arc<dyn AgentExecutor>,
        strategy: Box<dyn LoadBalancingStrategy>,
        rules: Vec<WeightedRule>,
    ) -> Result<Self> {
        let scheduler = Scheduler::new(config, executor, strategy, Some(rules))?;
        Ok(Self {
            scheduler: Arc::new(scheduler),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        self.scheduler.config()
    }

    /// Start dispatching. Calling it again is a no-op; after shutdown it
    /// returns `ShuttingDown`.
    pub fn start(&self) -> Result<()> {
        self.scheduler.start()
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        self.scheduler.shutdown().await
    }

    pub async fn submit_task(&self, spec: TaskSpec) -> Result<TaskId> {
        self.scheduler.submit_task(spec).await
    }

    /// Submit several tasks atomically.
    pub async fn submit_tasks(&self, specs: Vec<TaskSpec>) -> Result<Vec<TaskId>> {
        self.scheduler.submit_tasks(specs).await
    }

    pub async fn cancel_task(&self, id: &TaskId) -> Result<()> {
        self.scheduler.cancel_task(id).await
    }

    pub async fn task_status(&self, id: &TaskId) -> Result<TaskStatus> {
        self.scheduler.task_status(id).await
    }

    pub async fn escalate(&self, id: &TaskId, boost: f64, reason: &str) -> Result<()> {
        self.scheduler.escalate(id, boost, reason).await
    }

    /// Every attempt of a task, oldest first.
    pub fn execution_records(&self, id: &TaskId) -> Vec<ExecutionRecord> {
        self.scheduler.execution_records(id)
    }

    pub fn register_agent(&self, spec: AgentSpec) -> Result<AgentId> {
        self.scheduler.register_agent(spec, None)
    }

    pub fn register_agent_with_executor(
        &self,
        spec: AgentSpec,
        executor: Arc<dyn AgentExecutor>,
    ) -> Result<AgentId> {
        self.scheduler.register_agent(spec, Some(executor))
    }

    /// Remove an agent. With in-flight work, `force = false` marks it
    /// unavailable and fails with `AgentBusy`; `force = true` cancels its
    /// attempts, re-queues those tasks, and removes the agent once drained.
    pub fn unregister_agent(&self, id: &AgentId, force: bool) -> Result<()> {
        self.scheduler.unregister_agent(id, force)
    }

    pub fn agent(&self, id: &AgentId) -> Option<AgentSnapshot> {
        self.scheduler.agent(id)
    }

    pub fn agents(&self) -> Vec<AgentSnapshot> {
        self.scheduler.agents()
    }

    pub async fn system_status(&self) -> SystemStatus {
        self.scheduler.system_status().await
    }

    /// Subscribe to a topic from [`topics`](crate::orchestration::topics),
    /// or `"*"` for everything.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.scheduler.subscribe(topic, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.scheduler.unsubscribe(id)
    }
}
