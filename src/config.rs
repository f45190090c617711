use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestration::StrategyKind;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Global cap on in-flight attempts.
    pub max_concurrent_tasks: usize,
    /// Admission limit of the ready queue.
    pub queue_capacity: usize,
    /// Dispatcher wake-up interval when nothing signals it.
    pub dispatch_tick_ms: u64,
    pub default_timeout_ms: u64,
    /// How long an executor has to acknowledge cancellation.
    pub cancel_grace_ms: u64,
    pub shutdown_grace_ms: u64,
    /// How long terminal tasks stay queryable.
    pub retention_secs: u64,
    pub purge_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 8,
            queue_capacity: 1024,
            dispatch_tick_ms: 250,
            default_timeout_ms: 300_000,
            cancel_grace_ms: 2_000,
            shutdown_grace_ms: 10_000,
            retention_secs: 3_600,
            purge_interval_ms: 30_000,
        }
    }
}

impl SchedulerConfig {
    pub fn dispatch_tick(&self) -> Duration {
        Duration::from_millis(self.dispatch_tick_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; a task runs at most `max_retries + 1` times.
    pub max_retries: u32,
    /// Delay before each retry. The last value repeats.
    pub backoff_ms: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: vec![1_000, 5_000, 15_000],
        }
    }
}

impl RetryConfig {
    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let index = (attempt.max(1) - 1) as usize;
        let ms = self
            .backoff_ms
            .get(index)
            .or_else(|| self.backoff_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Consecutive failures before an agent is marked Error.
    pub failure_threshold: u32,
    /// Time an Error agent waits before it may take a probe task.
    pub cooldown_ms: u64,
    /// Weight of the newest outcome in the success-rate moving average.
    pub success_rate_alpha: f64,
    pub strategy: StrategyKind,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 30_000,
            success_rate_alpha: 0.2,
            strategy: StrategyKind::LeastLoaded,
        }
    }
}

impl AgentsConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub recompute_interval_ms: u64,
    pub age_weight: f64,
    pub max_age_minutes: f64,
    pub deadline_weight: f64,
    pub deadline_horizon_secs: u64,
    pub business_value_weight: f64,
    pub escalation_weight: f64,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            recompute_interval_ms: 5_000,
            age_weight: 0.5,
            max_age_minutes: 30.0,
            deadline_weight: 1.0,
            deadline_horizon_secs: 600,
            business_value_weight: 1.0,
            escalation_weight: 1.0,
        }
    }
}

impl PriorityConfig {
    pub fn recompute_interval(&self) -> Duration {
        Duration::from_millis(self.recompute_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Per-subscriber channel size; events beyond it are dropped.
    pub subscriber_buffer: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub agents: AgentsConfig,
    pub priority: PriorityConfig,
    pub events: EventsConfig,
}

impl OrchestratorConfig {
    pub fn app_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".agentflow"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::app_dir()?.join("agentflow.toml"))
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading config");
        if !path.exists() {
            tracing::debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        tracing::debug!(
            max_concurrent = config.scheduler.max_concurrent_tasks,
            queue_capacity = config.scheduler.queue_capacity,
            strategy = ?config.agents.strategy,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tracing::debug!(dir = %parent.display(), "creating config directory");
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_toml()?)?;
        tracing::debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent_tasks == 0 {
            return Err(Error::Validation(
                "scheduler.max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.scheduler.queue_capacity == 0 {
            return Err(Error::Validation(
                "scheduler.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.scheduler.default_timeout_ms == 0 {
            return Err(Error::Validation(
                "scheduler.default_timeout_ms must be positive".to_string(),
            ));
        }
        if self.scheduler.dispatch_tick_ms == 0 || self.scheduler.purge_interval_ms == 0 {
            return Err(Error::Validation(
                "scheduler tick intervals must be positive".to_string(),
            ));
        }
        if self.retry.backoff_ms.is_empty() {
            return Err(Error::Validation(
                "retry.backoff_ms must contain at least one delay".to_string(),
            ));
        }
        let alpha = self.agents.success_rate_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(Error::Validation(format!(
                "agents.success_rate_alpha must be in (0, 1], got {}",
                alpha
            )));
        }
        if self.agents.failure_threshold == 0 {
            return Err(Error::Validation(
                "agents.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.priority.recompute_interval_ms == 0 {
            return Err(Error::Validation(
                "priority.recompute_interval_ms must be positive".to_string(),
            ));
        }
        if self.events.subscriber_buffer == 0 {
            return Err(Error::Validation(
                "events.subscriber_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
