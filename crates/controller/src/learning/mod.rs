//! # Adaptive Learning
//!
//! Mines execution traces and failure events for stable behavior, decides when a
//! task warrants re-synthesis, and drives the resulting artifact through rollout.
//!
//! - [`analyzer`]: pattern detection over a task's traces
//! - [`failures`]: warning-event parsing and consecutive-failure accounting
//! - [`triggers`]: trace-volume, error-rate and consecutive-failure triggers
//! - [`fallback`]: deterministic code templates used when synthesis is unavailable
//! - [`status`]: durable per-task learning state
//! - [`orchestrator`]: turns fired triggers into published artifacts
//! - [`controller`]: the per-agent reconcile

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub mod analyzer;
pub mod controller;
pub mod failures;
pub mod fallback;
pub mod orchestrator;
pub mod status;
pub mod triggers;

pub use analyzer::{analyze_task_patterns, PatternAnalysis};
pub use controller::reconcile_language_agent;
pub use status::{LearningRecord, LearningStatusStore, TaskLearningStatus};
pub use triggers::{LearningEvent, TriggerEvaluator, TriggerKind};

/// One observed execution of a named task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTrace {
    pub task_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub duration: Duration,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// One tool invocation inside a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub method: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub result: serde_json::Value,
    pub duration: Duration,
    pub success: bool,
}

impl ToolCall {
    /// `tool.method` signature element
    pub fn signature(&self) -> String {
        format!("{}.{}", self.tool_name, self.method)
    }
}

/// Group traces by task name, preserving arrival order within each task
pub fn group_traces_by_task(traces: Vec<TaskTrace>) -> BTreeMap<String, Vec<TaskTrace>> {
    let mut groups: BTreeMap<String, Vec<TaskTrace>> = BTreeMap::new();
    for trace in traces {
        groups.entry(trace.task_name.clone()).or_default().push(trace);
    }
    groups
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::{TaskTrace, ToolCall};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::time::Duration;

    pub fn tool(tool_name: &str, method: &str) -> ToolCall {
        ToolCall {
            tool_name: tool_name.to_string(),
            method: method.to_string(),
            parameters: BTreeMap::new(),
            result: serde_json::Value::Null,
            duration: Duration::from_millis(50),
            success: true,
        }
    }

    pub fn trace(task: &str, success: bool, calls: &[(&str, &str)]) -> TaskTrace {
        TaskTrace {
            task_name: task.to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            tool_calls: calls.iter().map(|(t, m)| tool(t, m)).collect(),
            duration: Duration::from_secs(1),
            success,
            error_message: if success {
                None
            } else {
                Some("boom".to_string())
            },
        }
    }
}
