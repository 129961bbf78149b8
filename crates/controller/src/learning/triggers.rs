//! Learning trigger evaluation

use super::analyzer::analyze_task_patterns;
use super::failures::{recent_error_rate, update_consecutive_failures, TaskFailure};
use super::status::{LearningRecord, TaskLearningStatus};
use super::TaskTrace;
use crate::tasks::config::LearningConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Fixed confidence assigned to error-driven re-synthesis
pub const CONSECUTIVE_FAILURE_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    TracesAccumulated,
    ErrorThreshold,
    ConsecutiveFailures,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::TracesAccumulated => "traces_accumulated",
            TriggerKind::ErrorThreshold => "error_threshold",
            TriggerKind::ConsecutiveFailures => "consecutive_failures",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fired decision to re-synthesize one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningEvent {
    pub agent: String,
    pub task: String,
    pub kind: TriggerKind,
    pub trace_count: u32,
    pub error_rate: f64,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// Decides which tasks warrant re-synthesis
#[derive(Debug, Clone)]
pub struct TriggerEvaluator {
    config: LearningConfig,
}

impl TriggerEvaluator {
    pub fn new(config: LearningConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    /// Trace-volume and error-rate triggers. Refreshes trace counts, success
    /// times and analysis results on every task seen in `traces`.
    pub fn evaluate_traces(
        &self,
        agent: &str,
        record: &mut LearningRecord,
        traces: &BTreeMap<String, Vec<TaskTrace>>,
        now: DateTime<Utc>,
    ) -> Vec<LearningEvent> {
        let mut fired = Vec::new();

        for (task, task_traces) in traces {
            let status = record.get_or_insert(task);
            status.trace_count = u32::try_from(task_traces.len()).unwrap_or(u32::MAX);
            observe_successes(status, task_traces);

            if status.is_symbolic {
                debug!(task = %task, "Task already symbolic, skipping");
                continue;
            }
            if status.in_cooldown(self.config.learning_interval(), now) {
                debug!(task = %task, "Learning cooldown active, skipping");
                continue;
            }
            if status.trace_count < self.config.learning_threshold {
                continue;
            }

            let analysis = analyze_task_patterns(task, task_traces);
            status.pattern_confidence = analysis.confidence;
            status.common_pattern = Some(analysis.common_pattern.to_string());
            status.unique_pattern_count = analysis.unique_pattern_count;
            status.error_rate = analysis.error_rate;

            if analysis.confidence >= self.config.pattern_confidence_min
                && analysis.is_deterministic
            {
                fired.push(LearningEvent {
                    agent: agent.to_string(),
                    task: task.clone(),
                    kind: TriggerKind::TracesAccumulated,
                    trace_count: status.trace_count,
                    error_rate: status.error_rate,
                    confidence: analysis.confidence,
                    timestamp: now,
                });
            }

            if status.error_rate > self.config.error_rate_threshold
                && analysis.confidence > self.config.error_rate_confidence_min
            {
                fired.push(LearningEvent {
                    agent: agent.to_string(),
                    task: task.clone(),
                    kind: TriggerKind::ErrorThreshold,
                    trace_count: status.trace_count,
                    error_rate: status.error_rate,
                    confidence: analysis.confidence,
                    timestamp: now,
                });
            }
        }

        fired
    }

    /// Consecutive-failure triggers from parsed failure events
    pub fn evaluate_failures(
        &self,
        agent: &str,
        record: &mut LearningRecord,
        failures: &BTreeMap<String, Vec<TaskFailure>>,
        now: DateTime<Utc>,
    ) -> Vec<LearningEvent> {
        let mut fired = Vec::new();

        for (task, task_failures) in failures {
            let status = record.get_or_insert(task);
            update_consecutive_failures(status, task_failures, self.config.failure_window(), now);

            if !self.should_trigger_error_resynthesis(status, now) {
                continue;
            }

            info!(
                agent = %agent,
                task = %task,
                consecutive_failures = status.consecutive_failures,
                threshold = self.config.error_failure_threshold,
                "Error-triggered re-synthesis condition met"
            );
            fired.push(LearningEvent {
                agent: agent.to_string(),
                task: task.clone(),
                kind: TriggerKind::ConsecutiveFailures,
                trace_count: status.trace_count,
                error_rate: recent_error_rate(task_failures, now),
                confidence: CONSECUTIVE_FAILURE_CONFIDENCE,
                timestamp: now,
            });
        }

        fired
    }

    /// All conditions for error-driven re-synthesis hold
    pub fn should_trigger_error_resynthesis(
        &self,
        status: &TaskLearningStatus,
        now: DateTime<Utc>,
    ) -> bool {
        if status.is_symbolic {
            return false;
        }
        if status.consecutive_failures < self.config.error_failure_threshold {
            return false;
        }
        if status.in_cooldown(self.config.error_cooldown(), now)
            || status.in_cooldown(self.config.learning_interval(), now)
        {
            return false;
        }
        if status.error_resynthesis_attempts >= self.config.max_error_resynthesis_attempts {
            return false;
        }
        // never worked: nothing to repair
        if status.last_success_time.is_none() && status.trace_count == 0 {
            return false;
        }
        true
    }
}

/// Record the newest successful trace; a success after the last failure ends the streak
fn observe_successes(status: &mut TaskLearningStatus, traces: &[TaskTrace]) {
    let Some(latest) = traces
        .iter()
        .filter(|t| t.success)
        .map(|t| t.timestamp)
        .max()
    else {
        return;
    };

    if status.last_success_time.map_or(true, |prev| latest > prev) {
        status.last_success_time = Some(latest);
    }
    if status
        .last_failure_time
        .map_or(true, |failure| latest > failure)
    {
        status.consecutive_failures = 0;
    }
}
