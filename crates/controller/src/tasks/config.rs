//! Learning Controller Configuration
//!
//! Thresholds, cooldowns and backends for the learning and self-healing engine.
//! Loaded from the mounted `config.yaml`; every field has a default so a partial
//! file is enough.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main controller configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Learning trigger configuration
    #[serde(default)]
    pub learning: LearningConfig,

    /// Artifact retention configuration
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Rollout configuration
    #[serde(default)]
    pub rollout: RolloutConfig,

    /// Self-healing configuration
    #[serde(default, rename = "selfHealing")]
    pub self_healing: SelfHealingConfig,

    /// Trace backend configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Synthesis service configuration
    #[serde(default)]
    pub synthesis: SynthesisConfig,
}

/// Learning trigger configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LearningConfig {
    /// Global learning switch
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum traces before a task is analyzed
    #[serde(default = "default_learning_threshold", rename = "learningThreshold")]
    pub learning_threshold: u32,

    /// Cooldown between learning attempts, also the idle requeue interval
    #[serde(default = "default_learning_interval", rename = "learningIntervalSeconds")]
    pub learning_interval_seconds: u64,

    /// Minimum analyzer confidence for the trace-volume trigger
    #[serde(default = "default_pattern_confidence_min", rename = "patternConfidenceMin")]
    pub pattern_confidence_min: f64,

    /// Error rate above which the error-rate trigger fires
    #[serde(default = "default_error_rate_threshold", rename = "errorRateThreshold")]
    pub error_rate_threshold: f64,

    /// Minimum analyzer confidence for the error-rate trigger
    #[serde(default = "default_error_rate_confidence_min", rename = "errorRateConfidenceMin")]
    pub error_rate_confidence_min: f64,

    /// Consecutive failures before error-driven re-synthesis
    #[serde(default = "default_error_failure_threshold", rename = "errorFailureThreshold")]
    pub error_failure_threshold: u32,

    /// Cooldown between error-driven re-synthesis attempts
    #[serde(default = "default_error_cooldown", rename = "errorCooldownSeconds")]
    pub error_cooldown_seconds: u64,

    /// Cap on error-driven re-synthesis attempts per task
    #[serde(
        default = "default_max_error_resynthesis_attempts",
        rename = "maxErrorResynthesisAttempts"
    )]
    pub max_error_resynthesis_attempts: u32,

    /// Failures older than this no longer count toward the streak
    #[serde(default = "default_failure_window", rename = "failureWindowSeconds")]
    pub failure_window_seconds: u64,

    /// How far back warning events are scanned for task failures
    #[serde(default = "default_lookback", rename = "eventLookbackSeconds")]
    pub event_lookback_seconds: u64,

    /// How far back spans are queried
    #[serde(default = "default_lookback", rename = "traceLookbackSeconds")]
    pub trace_lookback_seconds: u64,

    /// Upper bound on spans fetched per reconcile
    #[serde(default = "default_trace_query_limit", rename = "traceQueryLimit")]
    pub trace_query_limit: usize,
}

/// Artifact retention configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    /// Number of versions to keep; version 1 is always kept on top of these
    #[serde(default = "default_max_versions", rename = "maxVersions")]
    pub max_versions: usize,

    /// Delete versions older than this many days (0 disables age-based cleanup)
    #[serde(default, rename = "cleanupAfterDays")]
    pub cleanup_after_days: u32,
}

/// Rollout configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RolloutConfig {
    /// Requeue interval while waiting for convergence
    #[serde(default = "default_poll_interval", rename = "pollIntervalSeconds")]
    pub poll_interval_seconds: u64,

    /// Deadline after which the rollout is rolled back
    #[serde(default = "default_rollout_timeout", rename = "timeoutSeconds")]
    pub timeout_seconds: u64,
}

/// Self-healing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SelfHealingConfig {
    /// Self-healing switch
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Attempts before the agent is marked Failed
    #[serde(default = "default_max_self_healing_attempts", rename = "maxAttempts")]
    pub max_attempts: i32,

    /// Consecutive pod failures before self-healing acts
    #[serde(default = "default_self_healing_failure_threshold", rename = "failureThreshold")]
    pub failure_threshold: i32,

    /// Backoff ceiling in minutes
    #[serde(default = "default_max_backoff_minutes", rename = "maxBackoffMinutes")]
    pub max_backoff_minutes: u64,

    /// Number of runtime errors kept in status
    #[serde(default = "default_runtime_error_history", rename = "runtimeErrorHistory")]
    pub runtime_error_history: usize,
}

/// Trace backend configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// Backend kind
    #[serde(default)]
    pub backend: TelemetryBackend,

    /// Base URL of the query API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env", rename = "apiKeyEnv")]
    pub api_key_env: String,
}

/// Supported trace backends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryBackend {
    /// No trace backend; learning sees no traces
    #[default]
    None,
    /// SigNoz query API
    Signoz,
}

/// Synthesis service configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SynthesisConfig {
    /// HTTP endpoint of the synthesis service; unset means unavailable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Request timeout
    #[serde(default = "default_synthesis_timeout", rename = "timeoutSeconds")]
    pub timeout_seconds: u64,
}

fn default_true() -> bool {
    true
}

fn default_learning_threshold() -> u32 {
    10
}

fn default_learning_interval() -> u64 {
    300
}

fn default_pattern_confidence_min() -> f64 {
    0.8
}

fn default_error_rate_threshold() -> f64 {
    0.2
}

fn default_error_rate_confidence_min() -> f64 {
    0.5
}

fn default_error_failure_threshold() -> u32 {
    3
}

fn default_error_cooldown() -> u64 {
    300
}

fn default_max_error_resynthesis_attempts() -> u32 {
    3
}

fn default_failure_window() -> u64 {
    2 * 60 * 60
}

fn default_lookback() -> u64 {
    24 * 60 * 60
}

fn default_trace_query_limit() -> usize {
    1000
}

fn default_max_versions() -> usize {
    5
}

fn default_poll_interval() -> u64 {
    5
}

fn default_rollout_timeout() -> u64 {
    300
}

fn default_max_self_healing_attempts() -> i32 {
    5
}

fn default_self_healing_failure_threshold() -> i32 {
    2
}

fn default_max_backoff_minutes() -> u64 {
    16
}

fn default_runtime_error_history() -> usize {
    10
}

fn default_api_key_env() -> String {
    "SIGNOZ_API_KEY".to_string()
}

fn default_synthesis_timeout() -> u64 {
    120
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            learning_threshold: default_learning_threshold(),
            learning_interval_seconds: default_learning_interval(),
            pattern_confidence_min: default_pattern_confidence_min(),
            error_rate_threshold: default_error_rate_threshold(),
            error_rate_confidence_min: default_error_rate_confidence_min(),
            error_failure_threshold: default_error_failure_threshold(),
            error_cooldown_seconds: default_error_cooldown(),
            max_error_resynthesis_attempts: default_max_error_resynthesis_attempts(),
            failure_window_seconds: default_failure_window(),
            event_lookback_seconds: default_lookback(),
            trace_lookback_seconds: default_lookback(),
            trace_query_limit: default_trace_query_limit(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_versions: default_max_versions(),
            cleanup_after_days: 0,
        }
    }
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            timeout_seconds: default_rollout_timeout(),
        }
    }
}

impl Default for SelfHealingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_self_healing_attempts(),
            failure_threshold: default_self_healing_failure_threshold(),
            max_backoff_minutes: default_max_backoff_minutes(),
            runtime_error_history: default_runtime_error_history(),
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_seconds: default_synthesis_timeout(),
        }
    }
}

impl LearningConfig {
    pub fn learning_interval(&self) -> Duration {
        Duration::from_secs(self.learning_interval_seconds)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_secs(self.error_cooldown_seconds)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_seconds)
    }
}

impl RolloutConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl ControllerConfig {
    /// Validate that thresholds are internally consistent
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let learning = &self.learning;
        for (name, value) in [
            ("learning.patternConfidenceMin", learning.pattern_confidence_min),
            ("learning.errorRateThreshold", learning.error_rate_threshold),
            ("learning.errorRateConfidenceMin", learning.error_rate_confidence_min),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow::anyhow!("{name} must be within [0, 1], got {value}"));
            }
        }

        if learning.learning_threshold == 0 {
            return Err(anyhow::anyhow!("learning.learningThreshold must be positive"));
        }

        if self.retention.max_versions == 0 {
            return Err(anyhow::anyhow!(
                "retention.maxVersions must keep at least one version"
            ));
        }

        if self.rollout.poll_interval_seconds == 0
            || self.rollout.timeout_seconds < self.rollout.poll_interval_seconds
        {
            return Err(anyhow::anyhow!(
                "rollout.timeoutSeconds must be at least rollout.pollIntervalSeconds (> 0)"
            ));
        }

        if self.self_healing.max_attempts < 1 {
            return Err(anyhow::anyhow!("selfHealing.maxAttempts must be positive"));
        }

        if self.telemetry.backend == TelemetryBackend::Signoz && self.telemetry.endpoint.is_none()
        {
            return Err(anyhow::anyhow!(
                "telemetry.endpoint is required for the signoz backend"
            ));
        }

        Ok(())
    }

    /// Load configuration from mounted `ConfigMap` file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        let config: ControllerConfig = serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))?;

        Ok(config)
    }
}
