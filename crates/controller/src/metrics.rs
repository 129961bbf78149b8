//! # Learning Metrics
//!
//! In-process counters for the learning and self-healing engine. A single
//! [`LearningMetrics`] is created at startup, shared through the reconcile
//! context and rendered as JSON by the `/metrics` endpoint.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Windowed learning success rate for one agent
#[derive(Debug, Clone, Serialize)]
pub struct SuccessRateAggregator {
    total_attempts: u64,
    successful_attempts: u64,
    window_start: DateTime<Utc>,
    #[serde(skip)]
    window: Duration,
}

impl SuccessRateAggregator {
    #[must_use]
    pub fn new(window: Duration, now: DateTime<Utc>) -> Self {
        Self {
            total_attempts: 0,
            successful_attempts: 0,
            window_start: now,
            window,
        }
    }

    /// Record one attempt, starting a fresh window first if the current one expired
    pub fn add_attempt(&mut self, successful: bool, now: DateTime<Utc>) {
        if now - self.window_start > self.window {
            self.total_attempts = 0;
            self.successful_attempts = 0;
            self.window_start = now;
        }
        self.total_attempts += 1;
        if successful {
            self.successful_attempts += 1;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            return 0.0;
        }
        self.successful_attempts as f64 / self.total_attempts as f64
    }
}

/// Snapshot rendered by the metrics endpoint
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub triggers_fired: BTreeMap<String, u64>,
    pub learning_successes: u64,
    pub learning_failures: u64,
    pub rollbacks: u64,
    pub self_healing_attempts: u64,
    pub success_rates: BTreeMap<String, f64>,
}

/// Process-wide learning counters
pub struct LearningMetrics {
    triggers_fired: Mutex<BTreeMap<String, u64>>,
    learning_successes: AtomicU64,
    learning_failures: AtomicU64,
    rollbacks: AtomicU64,
    self_healing_attempts: AtomicU64,
    success_rates: Mutex<BTreeMap<String, SuccessRateAggregator>>,
    window: Duration,
}

impl Default for LearningMetrics {
    fn default() -> Self {
        Self::new(Duration::hours(24))
    }
}

impl LearningMetrics {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            triggers_fired: Mutex::new(BTreeMap::new()),
            learning_successes: AtomicU64::new(0),
            learning_failures: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            self_healing_attempts: AtomicU64::new(0),
            success_rates: Mutex::new(BTreeMap::new()),
            window,
        }
    }

    pub fn record_trigger(&self, kind: &str) {
        if let Ok(mut triggers) = self.triggers_fired.lock() {
            *triggers.entry(kind.to_string()).or_insert(0) += 1;
        }
    }

    /// Record the outcome of a learning attempt for `agent_key` (namespace/name)
    pub fn record_learning_outcome(&self, agent_key: &str, successful: bool) {
        if successful {
            self.learning_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.learning_failures.fetch_add(1, Ordering::Relaxed);
        }

        let now = Utc::now();
        if let Ok(mut rates) = self.success_rates.lock() {
            rates
                .entry(agent_key.to_string())
                .or_insert_with(|| SuccessRateAggregator::new(self.window, now))
                .add_attempt(successful, now);
        }
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_self_healing_attempt(&self) {
        self.self_healing_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let triggers_fired = self
            .triggers_fired
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default();
        let success_rates = self
            .success_rates
            .lock()
            .map(|rates| {
                rates
                    .iter()
                    .map(|(agent, agg)| (agent.clone(), agg.success_rate()))
                    .collect()
            })
            .unwrap_or_default();

        MetricsSnapshot {
            triggers_fired,
            learning_successes: self.learning_successes.load(Ordering::Relaxed),
            learning_failures: self.learning_failures.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            self_healing_attempts: self.self_healing_attempts.load(Ordering::Relaxed),
            success_rates,
        }
    }
}
