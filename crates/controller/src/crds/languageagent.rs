//! `LanguageAgent` Custom Resource Definition for adaptive AI agents

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default function for `execution_mode` field
fn default_execution_mode() -> String {
    "autonomous".to_string()
}

/// `LanguageAgent` CRD describing an agent whose code is synthesized from instructions
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "langop.io", version = "v1alpha1", kind = "LanguageAgent")]
#[kube(namespaced)]
#[kube(status = "LanguageAgentStatus")]
#[kube(shortname = "lagent")]
#[kube(printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.executionMode"}"#)]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Failures","type":"integer","jsonPath":".status.consecutiveFailures"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct LanguageAgentSpec {
    /// Natural-language instructions the agent code is synthesized from
    #[serde(default)]
    pub instructions: String,

    /// High-level goal for autonomous agents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,

    /// Execution mode: "autonomous" (default), "scheduled" or "interactive"
    #[serde(default = "default_execution_mode", rename = "executionMode")]
    pub execution_mode: String,

    /// Cron schedule for scheduled agents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Names of the tools available to the agent
    #[serde(default, rename = "toolRefs")]
    pub tool_refs: Vec<String>,

    /// Names of the models available to the agent
    #[serde(default, rename = "modelRefs")]
    pub model_refs: Vec<String>,

    /// Distilled persona text passed through to synthesis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
}

/// Status of the `LanguageAgent`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct LanguageAgentStatus {
    /// Current phase (Pending, Running, Failed, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Human-readable message about the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Machine-readable reason for the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Conditions for the `LanguageAgent`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<AgentCondition>>,

    /// Code synthesis bookkeeping
    #[serde(default, rename = "synthesisInfo", skip_serializing_if = "Option::is_none")]
    pub synthesis_info: Option<SynthesisInfo>,

    /// Recent runtime errors, newest last
    #[serde(default, rename = "runtimeErrors")]
    pub runtime_errors: Vec<RuntimeError>,

    /// Last crash output captured from the agent container
    #[serde(default, rename = "lastCrashLog", skip_serializing_if = "Option::is_none")]
    pub last_crash_log: Option<String>,

    /// Consecutive pod failures in the current streak
    #[serde(default, rename = "consecutiveFailures")]
    pub consecutive_failures: i32,

    /// Failure category (Synthesis, Runtime, Infrastructure). Serialized as
    /// `null` when unset so a merge patch clears it.
    #[serde(default, rename = "failureReason")]
    pub failure_reason: Option<String>,

    /// Self-healing synthesis attempts made so far
    #[serde(default, rename = "selfHealingAttempts")]
    pub self_healing_attempts: i32,

    /// Last code known to run without crashing
    #[serde(default, rename = "lastSuccessfulCode", skip_serializing_if = "Option::is_none")]
    pub last_successful_code: Option<String>,
}

/// Metadata about agent code synthesis
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct SynthesisInfo {
    /// When code was last synthesized (RFC3339)
    #[serde(default, rename = "lastSynthesisTime", skip_serializing_if = "Option::is_none")]
    pub last_synthesis_time: Option<String>,

    /// How long the last synthesis took, in seconds
    #[serde(default, rename = "synthesisDuration")]
    pub synthesis_duration: f64,

    /// SHA256 of the current synthesized code
    #[serde(default, rename = "codeHash", skip_serializing_if = "Option::is_none")]
    pub code_hash: Option<String>,

    /// Validation errors reported by the last synthesis
    #[serde(default, rename = "validationErrors")]
    pub validation_errors: Vec<String>,

    /// Number of synthesis attempts for the current instructions
    #[serde(default, rename = "synthesisAttempts")]
    pub synthesis_attempts: i32,
}

/// One observed runtime failure of the agent container
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct RuntimeError {
    /// When the error was observed (RFC3339)
    pub timestamp: String,

    /// Error type or container waiting/termination reason
    #[serde(default, rename = "errorType")]
    pub error_type: String,

    /// Error message
    #[serde(default, rename = "errorMessage")]
    pub error_message: String,

    /// Stack trace lines, when available
    #[serde(default, rename = "stackTrace")]
    pub stack_trace: Vec<String>,

    /// Container exit code
    #[serde(default, rename = "exitCode")]
    pub exit_code: i32,

    /// Self-healing iteration this error occurred in
    #[serde(default, rename = "synthesisAttempt")]
    pub synthesis_attempt: i32,

    /// Pod the failure was observed on
    #[serde(default, rename = "podName")]
    pub pod_name: String,

    /// Container restart count when the failure was observed
    #[serde(default, rename = "restartCount")]
    pub restart_count: i32,
}

/// Condition for the `LanguageAgent`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct AgentCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, or Unknown)
    pub status: String,

    /// Last time the condition transitioned (RFC3339 format)
    #[serde(default, rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Reason for the condition's last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message indicating details about last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SynthesisInfo {
    /// Parsed `last_synthesis_time`, if present and well-formed
    pub fn last_synthesis_at(&self) -> Option<DateTime<Utc>> {
        self.last_synthesis_time
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }
}

impl LanguageAgentStatus {
    /// Insert or replace a condition, keeping the transition time when the status is unchanged
    pub fn set_condition(&mut self, condition: AgentCondition) {
        let conditions = self.conditions.get_or_insert_with(Vec::new);
        if let Some(existing) = conditions
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            if existing.status == condition.status {
                let kept = existing.last_transition_time.clone();
                *existing = condition;
                existing.last_transition_time = kept;
            } else {
                *existing = condition;
            }
        } else {
            conditions.push(condition);
        }
    }

    /// Look up a condition by type
    pub fn condition(&self, condition_type: &str) -> Option<&AgentCondition> {
        self.conditions
            .as_ref()
            .and_then(|c| c.iter().find(|c| c.condition_type == condition_type))
    }
}
