//! Registry of agents available for dispatch.
//!
//! The `AgentRegistry` tracks every registered agent's capacity, current
//! load, rolling success rate, and health. Load counters change only
//! through its own methods. Selection and assignment happen under one write
//! lock so two dispatch decisions can never overbook the same agent.

use crate::agent::{AgentExecutor, AgentHealth, AgentId, AgentSnapshot, AgentSpec};
use crate::config::AgentsConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Health policy knobs, taken from [`AgentsConfig`].
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub alpha: f64,
}

impl From<&AgentsConfig> for HealthPolicy {
    fn from(config: &AgentsConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            cooldown: config.cooldown(),
            alpha: config.success_rate_alpha,
        }
    }
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::from(&AgentsConfig::default())
    }
}

struct AgentRecord {
    id: AgentId,
    name: String,
    capabilities: BTreeSet<String>,
    max_concurrent: usize,
    load: usize,
    success_rate: f64,
    consecutive_failures: u32,
    health: AgentHealth,
    error_since: Option<Instant>,
    total_completed: u64,
    total_failed: u64,
    registered_at: DateTime<Utc>,
    executor: Option<Arc<dyn AgentExecutor>>,
    draining: bool,
}

impl AgentRecord {
    fn is_eligible(&self, cooldown: Duration, now: Instant) -> bool {
        if self.draining || self.load >= self.max_concurrent {
            return false;
        }
        match self.health {
            AgentHealth::Idle | AgentHealth::Busy => true,
            // One probe at a time once the cool-down has passed.
            AgentHealth::Error => {
                self.load == 0
                    && self
                        .error_since
                        .map(|since| now.duration_since(since) >= cooldown)
                        .unwrap_or(true)
            }
            AgentHealth::Unavailable => false,
        }
    }

    fn settle_health(&mut self) {
        if self.draining {
            self.health = AgentHealth::Unavailable;
        } else if self.health != AgentHealth::Error {
            self.health = if self.load > 0 {
                AgentHealth::Busy
            } else {
                AgentHealth::Idle
            };
        }
    }

    fn snapshot(&self, cooldown: Duration, now: Instant) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            capabilities: self.capabilities.clone(),
            max_concurrent: self.max_concurrent,
            load: self.load,
            success_rate: self.success_rate,
            consecutive_failures: self.consecutive_failures,
            health: self.health,
            total_completed: self.total_completed,
            total_failed: self.total_failed,
            registered_at: self.registered_at,
            eligible: self.is_eligible(cooldown, now),
        }
    }
}

/// Result of an unregister request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unregistration {
    /// The agent had no in-flight work and is gone.
    Removed,
    /// Forced removal of a busy agent; it leaves once its attempts drain.
    Draining { in_flight: usize },
}

/// What happened to an agent when one of its attempts ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Retained,
    /// The agent was draining and its last attempt just finished.
    Removed,
}

/// Tracks registered agents.
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
    policy: HealthPolicy,
}

impl AgentRegistry {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// Register an agent, optionally with its own executor.
    ///
    /// # Errors
    ///
    /// - `Validation` if the spec is malformed
    /// - `DuplicateAgentId` if the id is already registered
    pub fn register(
        &self,
        spec: AgentSpec,
        executor: Option<Arc<dyn AgentExecutor>>,
    ) -> Result<AgentId> {
        spec.validate()?;
        let id = spec.id.clone().unwrap_or_else(AgentId::generate);

        let mut agents = self.agents.write();
        if agents.contains_key(&id) {
            return Err(Error::DuplicateAgentId(id));
        }
        agents.insert(
            id.clone(),
            AgentRecord {
                id: id.clone(),
                name: spec.name,
                capabilities: spec.capabilities,
                max_concurrent: spec.max_concurrent,
                load: 0,
                success_rate: 1.0,
                consecutive_failures: 0,
                health: AgentHealth::Idle,
                error_since: None,
                total_completed: 0,
                total_failed: 0,
                registered_at: Utc::now(),
                executor,
                draining: false,
            },
        );
        tracing::info!(agent = %id, "agent registered");
        Ok(id)
    }

    /// Remove an agent.
    ///
    /// An agent without in-flight work is removed at once. A busy agent is
    /// marked Unavailable so it takes no new work; without `force` the call
    /// then fails with `AgentBusy`, with `force` it reports `Draining` and
    /// the caller is expected to cancel the agent's attempts for
    /// reassignment. Either way the agent disappears when its load hits zero.
    pub fn unregister(&self, id: &AgentId, force: bool) -> Result<Unregistration> {
        let mut agents = self.agents.write();
        let record = agents
            .get_mut(id)
            .ok_or_else(|| Error::AgentNotFound(id.clone()))?;

        if record.load == 0 {
            agents.remove(id);
            tracing::info!(agent = %id, "agent unregistered");
            return Ok(Unregistration::Removed);
        }

        record.draining = true;
        record.health = AgentHealth::Unavailable;
        let in_flight = record.load;
        if force {
            tracing::info!(agent = %id, in_flight, "agent draining (forced)");
            Ok(Unregistration::Draining { in_flight })
        } else {
            tracing::info!(agent = %id, in_flight, "agent draining");
            Err(Error::AgentBusy {
                id: id.clone(),
                in_flight,
            })
        }
    }

    /// Pick an eligible agent for `capability` with `choose` and record the
    /// assignment, all under one write lock.
    pub fn assign_with<F>(&self, capability: &str, choose: F) -> Result<AgentId>
    where
        F: FnOnce(&[AgentSnapshot]) -> Option<AgentId>,
    {
        let now = Instant::now();
        let mut agents = self.agents.write();

        let mut candidates: Vec<AgentSnapshot> = agents
            .values()
            .filter(|r| r.capabilities.contains(capability))
            .filter(|r| r.is_eligible(self.policy.cooldown, now))
            .map(|r| r.snapshot(self.policy.cooldown, now))
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        let chosen = choose(&candidates).ok_or_else(|| Error::NoEligibleAgent {
            capability: capability.to_string(),
        })?;
        let record = agents
            .get_mut(&chosen)
            .filter(|r| r.capabilities.contains(capability))
            .filter(|r| r.is_eligible(self.policy.cooldown, now))
            .ok_or_else(|| Error::NoEligibleAgent {
                capability: capability.to_string(),
            })?;
        record.load += 1;
        record.settle_health();
        Ok(chosen)
    }

    /// Count a new in-flight attempt against an agent.
    pub fn record_assignment(&self, id: &AgentId) -> Result<()> {
        let now = Instant::now();
        let mut agents = self.agents.write();
        let record = agents
            .get_mut(id)
            .ok_or_else(|| Error::AgentNotFound(id.clone()))?;
        if !record.is_eligible(self.policy.cooldown, now) {
            return Err(Error::AgentBusy {
                id: id.clone(),
                in_flight: record.load,
            });
        }
        record.load += 1;
        record.settle_health();
        Ok(())
    }

    /// An attempt finished with a success or failure verdict.
    pub fn record_completion(&self, id: &AgentId, success: bool) -> Release {
        let mut agents = self.agents.write();
        let Some(record) = agents.get_mut(id) else {
            return Release::Retained;
        };
        record.load = record.load.saturating_sub(1);

        let outcome = if success { 1.0 } else { 0.0 };
        record.success_rate =
            self.policy.alpha * outcome + (1.0 - self.policy.alpha) * record.success_rate;

        if success {
            record.consecutive_failures = 0;
            record.total_completed += 1;
            if record.health == AgentHealth::Error {
                tracing::info!(agent = %id, "probe succeeded, agent healthy again");
                record.health = AgentHealth::Idle;
                record.error_since = None;
            }
        } else {
            record.consecutive_failures += 1;
            record.total_failed += 1;
            if record.health == AgentHealth::Error {
                tracing::warn!(agent = %id, "probe failed, restarting cool-down");
                record.error_since = Some(Instant::now());
            } else if record.consecutive_failures >= self.policy.failure_threshold
                && !record.draining
            {
                tracing::warn!(
                    agent = %id,
                    failures = record.consecutive_failures,
                    "agent marked unhealthy"
                );
                record.health = AgentHealth::Error;
                record.error_since = Some(Instant::now());
            }
        }
        record.settle_health();
        Self::remove_if_drained(&mut agents, id)
    }

    /// A cancelled attempt released its slot; no verdict on the agent.
    pub fn record_release(&self, id: &AgentId) -> Release {
        let mut agents = self.agents.write();
        let Some(record) = agents.get_mut(id) else {
            return Release::Retained;
        };
        record.load = record.load.saturating_sub(1);
        record.settle_health();
        Self::remove_if_drained(&mut agents, id)
    }

    fn remove_if_drained(agents: &mut HashMap<AgentId, AgentRecord>, id: &AgentId) -> Release {
        let drained = agents
            .get(id)
            .map(|r| r.draining && r.load == 0)
            .unwrap_or(false);
        if drained {
            agents.remove(id);
            tracing::info!(agent = %id, "drained agent removed");
            Release::Removed
        } else {
            Release::Retained
        }
    }

    pub fn get(&self, id: &AgentId) -> Option<AgentSnapshot> {
        let now = Instant::now();
        self.agents
            .read()
            .get(id)
            .map(|r| r.snapshot(self.policy.cooldown, now))
    }

    pub fn executor(&self, id: &AgentId) -> Option<Arc<dyn AgentExecutor>> {
        self.agents.read().get(id).and_then(|r| r.executor.clone())
    }

    /// Every agent, sorted by id.
    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        let now = Instant::now();
        let mut all: Vec<AgentSnapshot> = self
            .agents
            .read()
            .values()
            .map(|r| r.snapshot(self.policy.cooldown, now))
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Whether any agent advertises the capability, eligible or not.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.agents
            .read()
            .values()
            .any(|r| r.capabilities.contains(capability))
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.agents.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Sum of in-flight attempts across agents.
    pub fn total_load(&self) -> usize {
        self.agents.read().values().map(|r| r.load).sum()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(HealthPolicy::default())
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.len())
            .field("policy", &self.policy)
            .finish()
    }
}
