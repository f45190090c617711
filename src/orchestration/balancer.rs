//! Agent selection strategies.
//!
//! The [`LoadBalancer`] asks the registry for eligible candidates and lets a
//! pluggable [`LoadBalancingStrategy`] pick one. The registry records the
//! assignment under the same lock the candidates were read with.

use crate::agent::{AgentId, AgentSnapshot};
use crate::error::Result;
use crate::orchestration::registry::AgentRegistry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Picks one agent from eligible candidates, sorted by id.
pub trait LoadBalancingStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn select(&self, capability: &str, candidates: &[AgentSnapshot]) -> Option<AgentId>;
}

/// Built-in strategies, selectable from config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RoundRobin,
    LeastLoaded,
    CapabilityWeighted,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 3] = [
        StrategyKind::RoundRobin,
        StrategyKind::LeastLoaded,
        StrategyKind::CapabilityWeighted,
    ];

    pub fn build(&self) -> Box<dyn LoadBalancingStrategy> {
        match self {
            StrategyKind::RoundRobin => Box::new(RoundRobin::default()),
            StrategyKind::LeastLoaded => Box::new(LeastLoaded),
            StrategyKind::CapabilityWeighted => Box::new(CapabilityWeighted),
        }
    }
}

/// Rotates through candidates, one counter per capability.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counters: Mutex<HashMap<String, usize>>,
}

impl LoadBalancingStrategy for RoundRobin {
    fn name(&self) -> &str {
        "round_robin"
    }

    fn select(&self, capability: &str, candidates: &[AgentSnapshot]) -> Option<AgentId> {
        if candidates.is_empty() {
            return None;
        }
        let mut counters = self.counters.lock();
        let counter = counters.entry(capability.to_string()).or_insert(0);
        let chosen = &candidates[*counter % candidates.len()];
        *counter = counter.wrapping_add(1);
        Some(chosen.id.clone())
    }
}

/// Lowest load ratio; ties go to the higher success rate.
#[derive(Debug, Default)]
pub struct LeastLoaded;

impl LoadBalancingStrategy for LeastLoaded {
    fn name(&self) -> &str {
        "least_loaded"
    }

    fn select(&self, _capability: &str, candidates: &[AgentSnapshot]) -> Option<AgentId> {
        candidates
            .iter()
            .min_by(|a, b| {
                a.load_ratio()
                    .total_cmp(&b.load_ratio())
                    .then_with(|| b.success_rate.total_cmp(&a.success_rate))
            })
            .map(|a| a.id.clone())
    }
}

/// Highest `success_rate * (1 - load_ratio)`.
#[derive(Debug, Default)]
pub struct CapabilityWeighted;

impl CapabilityWeighted {
    fn weight(agent: &AgentSnapshot) -> f64 {
        agent.success_rate * (1.0 - agent.load_ratio())
    }
}

impl LoadBalancingStrategy for CapabilityWeighted {
    fn name(&self) -> &str {
        "capability_weighted"
    }

    fn select(&self, _capability: &str, candidates: &[AgentSnapshot]) -> Option<AgentId> {
        // max_by keeps the last maximum; iterate in reverse so the lowest id wins ties.
        candidates
            .iter()
            .rev()
            .max_by(|a, b| Self::weight(a).total_cmp(&Self::weight(b)))
            .map(|a| a.id.clone())
    }
}

/// Matches tasks to agents.
pub struct LoadBalancer {
    registry: Arc<AgentRegistry>,
    strategy: Box<dyn LoadBalancingStrategy>,
}

impl LoadBalancer {
    pub fn new(registry: Arc<AgentRegistry>, strategy: Box<dyn LoadBalancingStrategy>) -> Self {
        tracing::debug!(strategy = strategy.name(), "load balancer created");
        Self { registry, strategy }
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Choose an agent for `capability` and count the assignment.
    ///
    /// # Errors
    ///
    /// Returns `NoEligibleAgent` when no agent can take the task right now.
    /// The caller keeps the task queued.
    pub fn select_agent(&self, capability: &str) -> Result<AgentId> {
        let agent = self
            .registry
            .assign_with(capability, |candidates| {
                self.strategy.select(capability, candidates)
            })?;
        tracing::debug!(agent = %agent, capability, strategy = self.strategy.name(), "agent selected");
        Ok(agent)
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("strategy", &self.strategy.name())
            .finish()
    }
}
