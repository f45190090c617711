//! Orchestration layer: priority policy, agent registry and balancing,
//! attempt execution, events, and the scheduler that drives them.

mod balancer;
mod engine;
mod events;
mod metrics;
mod orchestrator;
mod priority;
mod registry;
mod scheduler;

pub use balancer::{
    CapabilityWeighted, LeastLoaded, LoadBalancer, LoadBalancingStrategy, RoundRobin,
    StrategyKind,
};
pub use engine::{AttemptOutcome, AttemptPlan, CancelCause, ExecutionEngine};
pub use events::{topics, Event, EventBus, EventHandler, EventKind, SubscriptionId};
pub use metrics::{Metrics, MetricsSnapshot};
pub use orchestrator::Orchestrator;
pub use priority::{
    AgeRule, BusinessValueRule, DeadlineRule, Escalation, ManualEscalationRule, PriorityInput,
    PriorityManager, PriorityRule, WeightedRule, DEADLINE_FLOOR,
};
pub use registry::{AgentRegistry, HealthPolicy, Release, Unregistration};
pub use scheduler::{Scheduler, ShutdownReport, SystemStatus};
