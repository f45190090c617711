//! Effective priority computation.
//!
//! A task's base priority never changes. Its effective priority is the base
//! plus the weighted sum of every registered [`PriorityRule`], raised to the
//! highest floor any rule imposes. The scheduler recomputes it on a fixed
//! tick and re-ranks the queue with the result.

use crate::config::PriorityConfig;
use crate::core::task::{Task, TaskId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Score a deadline-violating task is lifted to, on top of its base.
pub const DEADLINE_FLOOR: f64 = 1000.0;

/// Maximum score the deadline rule gives inside its horizon.
const DEADLINE_MAX_SCORE: f64 = 20.0;

const BUSINESS_VALUE_KEY: &str = "business_value";

/// The task fields priority rules may read.
#[derive(Debug, Clone, Copy)]
pub struct PriorityInput<'a> {
    pub id: &'a TaskId,
    pub base: f64,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub context: &'a HashMap<String, serde_json::Value>,
}

impl<'a> PriorityInput<'a> {
    pub fn from_task(task: &'a Task) -> Self {
        Self {
            id: &task.id,
            base: task.priority.base_score(),
            created_at: task.created_at,
            deadline: task.deadline,
            context: &task.context,
        }
    }
}

/// A pure scoring function over a task.
pub trait PriorityRule: Send + Sync {
    fn name(&self) -> &str;

    fn score(&self, input: &PriorityInput<'_>, now: DateTime<Utc>) -> f64;

    /// Minimum effective priority this rule demands, if any.
    fn floor(&self, _input: &PriorityInput<'_>, _now: DateTime<Utc>) -> Option<f64> {
        None
    }
}

/// A rule with its weight in the sum.
pub struct WeightedRule {
    pub rule: Box<dyn PriorityRule>,
    pub weight: f64,
}

impl WeightedRule {
    pub fn new(rule: impl PriorityRule + 'static, weight: f64) -> Self {
        Self {
            rule: Box::new(rule),
            weight,
        }
    }

    /// Wrap a closure as a rule.
    pub fn from_fn<F>(name: &str, weight: f64, f: F) -> Self
    where
        F: Fn(&PriorityInput<'_>, DateTime<Utc>) -> f64 + Send + Sync + 'static,
    {
        Self::new(
            FnRule {
                name: name.to_string(),
                f: Box::new(f),
            },
            weight,
        )
    }
}

impl std::fmt::Debug for WeightedRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightedRule")
            .field("rule", &self.rule.name())
            .field("weight", &self.weight)
            .finish()
    }
}

type ScoreFn = Box<dyn Fn(&PriorityInput<'_>, DateTime<Utc>) -> f64 + Send + Sync>;

struct FnRule {
    name: String,
    f: ScoreFn,
}

impl PriorityRule for FnRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, input: &PriorityInput<'_>, now: DateTime<Utc>) -> f64 {
        (self.f)(input, now)
    }
}

/// Minutes waited since submission, capped.
#[derive(Debug, Clone)]
pub struct AgeRule {
    pub max_minutes: f64,
}

impl PriorityRule for AgeRule {
    fn name(&self) -> &str {
        "age"
    }

    fn score(&self, input: &PriorityInput<'_>, now: DateTime<Utc>) -> f64 {
        let waited = (now - input.created_at).num_milliseconds().max(0) as f64 / 60_000.0;
        waited.min(self.max_minutes)
    }
}

/// Rises quadratically as the deadline approaches; a missed deadline puts
/// the task ahead of all work that has not missed one.
#[derive(Debug, Clone)]
pub struct DeadlineRule {
    pub horizon_secs: u64,
}

impl DeadlineRule {
    fn remaining_secs(input: &PriorityInput<'_>, now: DateTime<Utc>) -> Option<f64> {
        input
            .deadline
            .map(|deadline| (deadline - now).num_milliseconds() as f64 / 1000.0)
    }
}

impl PriorityRule for DeadlineRule {
    fn name(&self) -> &str {
        "deadline"
    }

    fn score(&self, input: &PriorityInput<'_>, now: DateTime<Utc>) -> f64 {
        let Some(remaining) = Self::remaining_secs(input, now) else {
            return 0.0;
        };
        let horizon = self.horizon_secs as f64;
        if remaining <= 0.0 {
            DEADLINE_MAX_SCORE
        } else if remaining < horizon {
            let closeness = 1.0 - remaining / horizon;
            DEADLINE_MAX_SCORE * closeness * closeness
        } else {
            0.0
        }
    }

    fn floor(&self, input: &PriorityInput<'_>, now: DateTime<Utc>) -> Option<f64> {
        match Self::remaining_secs(input, now) {
            Some(remaining) if remaining <= 0.0 => Some(DEADLINE_FLOOR + input.base),
            _ => None,
        }
    }
}

/// Numeric `business_value` from the task context, clamped to `[0, 10]`.
#[derive(Debug, Clone, Default)]
pub struct BusinessValueRule;

impl PriorityRule for BusinessValueRule {
    fn name(&self) -> &str {
        "business_value"
    }

    fn score(&self, input: &PriorityInput<'_>, _now: DateTime<Utc>) -> f64 {
        input
            .context
            .get(BUSINESS_VALUE_KEY)
            .and_then(serde_json::Value::as_f64)
            .filter(|v| v.is_finite())
            .map(|v| v.clamp(0.0, 10.0))
            .unwrap_or(0.0)
    }
}

/// An operator-requested boost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub boost: f64,
    pub reason: String,
    pub at: DateTime<Utc>,
}

type EscalationTable = Arc<RwLock<HashMap<TaskId, Escalation>>>;

/// Adds the boost of the task's manual escalation, if any.
#[derive(Debug, Clone, Default)]
pub struct ManualEscalationRule {
    escalations: EscalationTable,
}

impl PriorityRule for ManualEscalationRule {
    fn name(&self) -> &str {
        "manual_escalation"
    }

    fn score(&self, input: &PriorityInput<'_>, _now: DateTime<Utc>) -> f64 {
        self.escalations
            .read()
            .get(input.id)
            .map(|e| e.boost)
            .unwrap_or(0.0)
    }
}

/// Owns the rule table and the escalation ledger.
pub struct PriorityManager {
    rules: Vec<WeightedRule>,
    escalations: EscalationTable,
}

impl PriorityManager {
    /// Built-in rules weighted from config.
    pub fn new(config: &PriorityConfig) -> Self {
        Self::with_rules(config, Self::default_rules(config))
    }

    /// Use `rules` instead of the built-in age/deadline/business-value set.
    /// Manual escalation is always present.
    pub fn with_rules(config: &PriorityConfig, rules: Vec<WeightedRule>) -> Self {
        let escalations = EscalationTable::default();
        let mut manager = Self {
            rules,
            escalations: escalations.clone(),
        };
        manager.add_rule(WeightedRule::new(
            ManualEscalationRule { escalations },
            config.escalation_weight,
        ));
        manager
    }

    pub fn default_rules(config: &PriorityConfig) -> Vec<WeightedRule> {
        vec![
            WeightedRule::new(
                AgeRule {
                    max_minutes: config.max_age_minutes,
                },
                config.age_weight,
            ),
            WeightedRule::new(
                DeadlineRule {
                    horizon_secs: config.deadline_horizon_secs,
                },
                config.deadline_weight,
            ),
            WeightedRule::new(BusinessValueRule, config.business_value_weight),
        ]
    }

    pub fn add_rule(&mut self, rule: WeightedRule) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.rule.name()).collect()
    }

    /// Base plus weighted rule scores, raised to the highest floor.
    pub fn effective_priority(&self, input: &PriorityInput<'_>, now: DateTime<Utc>) -> f64 {
        let mut score = input.base;
        let mut floor: Option<f64> = None;
        for weighted in &self.rules {
            let contribution = weighted.weight * weighted.rule.score(input, now);
            if contribution.is_finite() {
                score += contribution;
            }
            if let Some(f) = weighted.rule.floor(input, now) {
                floor = Some(floor.map_or(f, |current| current.max(f)));
            }
        }
        match floor {
            Some(f) if f > score => f,
            _ => score,
        }
    }

    /// Record a one-shot boost. A second escalation replaces the first.
    pub fn escalate(&self, id: &TaskId, boost: f64, reason: &str) {
        tracing::info!(task = %id, boost, reason, "task escalated");
        self.escalations.write().insert(
            id.clone(),
            Escalation {
                boost,
                reason: reason.to_string(),
                at: Utc::now(),
            },
        );
    }

    pub fn escalation(&self, id: &TaskId) -> Option<Escalation> {
        self.escalations.read().get(id).cloned()
    }

    /// Forget the escalation of a task that reached a terminal state.
    pub fn clear_escalation(&self, id: &TaskId) -> bool {
        self.escalations.write().remove(id).is_some()
    }
}

impl std::fmt::Debug for PriorityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityManager")
            .field("rules", &self.rules)
            .field("escalations", &self.escalations.read().len())
            .finish()
    }
}
