//! # Self-Healing Supervisor
//!
//! Watches the agent's pods for runtime failures, records them on the
//! `LanguageAgent` status, and re-synthesizes the agent code with the failure
//! history once enough consecutive failures have accumulated. Attempts are
//! spaced by exponential backoff and capped; hitting the cap marks the agent
//! `Failed` until someone intervenes.

use crate::artifacts::{code_hash, ArtifactStore, SynthesisType};
use crate::crds::{AgentCondition, LanguageAgent, LanguageAgentStatus, RuntimeError, SynthesisInfo};
use crate::events::{AuditEvent, EventPublisher};
use crate::learning::orchestrator::publish_artifact;
use crate::metrics::LearningMetrics;
use crate::rollout::{new_pending_rollout, PendingRollout, RolloutOrigin};
use crate::synthesis::{ErrorContext, SynthesisRequest, Synthesizer};
use crate::tasks::config::{RetentionConfig, SelfHealingConfig};
use crate::tasks::types::{Error, Result, AGENT_CONTAINER_NAME, AGENT_LABEL};
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::api::{Api, ListParams, LogParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Container waiting reasons that count as a failure
pub const FAILED_WAITING_REASONS: [&str; 4] = [
    "CrashLoopBackOff",
    "Error",
    "RunContainerError",
    "ImagePullBackOff",
];

pub const SYNTHESIZED_CONDITION: &str = "Synthesized";
pub const MAX_ATTEMPTS_REASON: &str = "MaxAttemptsExceeded";
pub const FAILED_PHASE: &str = "Failed";

const RUNTIME_FAILURE_REASON: &str = "Runtime";
const CRASH_LOG_TAIL_LINES: i64 = 100;

/// Backoff before the next attempt: `min(2^attempts, max)` minutes
pub fn backoff_minutes(attempts: i32, max_minutes: u64) -> u64 {
    let shift = u32::try_from(attempts.max(0)).unwrap_or(0);
    1_u64
        .checked_shl(shift)
        .filter(|v| *v != 0)
        .unwrap_or(u64::MAX)
        .min(max_minutes)
}

pub fn is_pod_failed(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() == Some("Failed") {
        return true;
    }

    status.container_statuses.iter().flatten().any(|cs| {
        let state = cs.state.as_ref();
        let waiting_failed = state
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.reason.as_deref())
            .is_some_and(|reason| FAILED_WAITING_REASONS.contains(&reason));
        let terminated_failed = state
            .and_then(|s| s.terminated.as_ref())
            .is_some_and(|t| t.exit_code != 0);
        waiting_failed || terminated_failed
    })
}

fn agent_container(pod: &Pod) -> Option<&ContainerStatus> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|cs| cs.name == AGENT_CONTAINER_NAME)
}

/// The agent container is running and ready
pub fn is_agent_ready(pod: &Pod) -> bool {
    agent_container(pod).is_some_and(|cs| cs.ready)
}

/// Failure details from the agent container of a failed pod
pub fn extract_runtime_error(pod: &Pod, attempt: i32, now: DateTime<Utc>) -> RuntimeError {
    let pod_name = pod.name_any();
    let mut error = RuntimeError {
        timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        synthesis_attempt: attempt,
        pod_name: pod_name.clone(),
        ..Default::default()
    };

    if let Some(cs) = agent_container(pod) {
        error.restart_count = cs.restart_count;
        let state = cs.state.as_ref();

        if let Some(waiting) = state.and_then(|s| s.waiting.as_ref()) {
            error.error_type = waiting.reason.clone().unwrap_or_default();
            error.error_message = waiting.message.clone().unwrap_or_default();
        }

        // a crash-looping container reports its exit in the previous state
        let terminated = state
            .and_then(|s| s.terminated.as_ref())
            .or_else(|| cs.last_state.as_ref().and_then(|s| s.terminated.as_ref()));
        if let Some(terminated) = terminated {
            error.exit_code = terminated.exit_code;
            if error.error_message.is_empty() {
                error.error_message = terminated.message.clone().unwrap_or_default();
            }
            if let Some(reason) = terminated.reason.as_deref().filter(|r| !r.is_empty()) {
                error.error_type = reason.to_string();
            }
        }
    }

    if error.error_message.is_empty() {
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown");
        error.error_message = format!("Pod {pod_name} failed with status {phase}");
    }
    error
}

fn container_summary(pod: &Pod) -> String {
    let Some(cs) = agent_container(pod) else {
        return format!("Pod {} failed. Agent container status unavailable", pod.name_any());
    };
    let state = cs
        .state
        .as_ref()
        .map(|s| {
            if let Some(w) = &s.waiting {
                format!("waiting ({})", w.reason.as_deref().unwrap_or("unknown"))
            } else if let Some(t) = &s.terminated {
                format!("terminated (exit code {})", t.exit_code)
            } else {
                "running".to_string()
            }
        })
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "Pod {} failed. Container {}: {state}, {} restarts",
        pod.name_any(),
        cs.name,
        cs.restart_count
    )
}

/// Result of folding a pod listing into the agent status
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FailureScan {
    /// Failures not previously recorded, as (pod, message)
    pub new_failures: Vec<(String, String)>,
    /// The streak was reset by a ready agent pod
    pub recovered: bool,
}

impl FailureScan {
    pub fn changed(&self) -> bool {
        !self.new_failures.is_empty() || self.recovered
    }
}

/// Record pod failures on `status`. A failure is counted once per (pod,
/// restart count); crash logs come from `crash_logs` when present.
pub fn record_pod_failures(
    status: &mut LanguageAgentStatus,
    pods: &[Pod],
    crash_logs: &dyn Fn(&Pod) -> Option<String>,
    history: usize,
    now: DateTime<Utc>,
) -> FailureScan {
    let mut scan = FailureScan::default();
    let seen: BTreeSet<(String, i32)> = status
        .runtime_errors
        .iter()
        .map(|e| (e.pod_name.clone(), e.restart_count))
        .collect();

    let failed: Vec<&Pod> = pods.iter().filter(|p| is_pod_failed(p)).collect();
    for pod in &failed {
        let error = extract_runtime_error(pod, status.self_healing_attempts, now);
        if seen.contains(&(error.pod_name.clone(), error.restart_count)) {
            continue;
        }

        info!(pod = %error.pod_name, error_type = %error.error_type, "Pod failure detected");
        scan.new_failures
            .push((error.pod_name.clone(), error.error_message.clone()));
        status.last_crash_log = Some(crash_logs(pod).unwrap_or_else(|| container_summary(pod)));
        status.consecutive_failures += 1;
        status.failure_reason = Some(RUNTIME_FAILURE_REASON.to_string());
        status.runtime_errors.push(error);
    }

    if status.runtime_errors.len() > history {
        let keep_from = status.runtime_errors.len() - history;
        status.runtime_errors = status.runtime_errors.split_off(keep_from);
    }

    if failed.is_empty() && status.consecutive_failures > 0 && pods.iter().any(is_agent_ready) {
        debug!("Agent pod ready, resetting failure streak");
        status.consecutive_failures = 0;
        status.failure_reason = None;
        scan.recovered = true;
    }

    scan
}

/// Whether failures on `status` warrant a self-healing attempt
pub fn should_attempt_self_healing(config: &SelfHealingConfig, status: &LanguageAgentStatus) -> bool {
    if !config.enabled {
        return false;
    }
    if status.consecutive_failures >= config.failure_threshold {
        return true;
    }
    let has_validation_errors = status
        .synthesis_info
        .as_ref()
        .is_some_and(|info| !info.validation_errors.is_empty());
    has_validation_errors && status.self_healing_attempts < config.max_attempts
}

/// Whether the agent was already marked failed after exhausting attempts
pub fn is_exhausted(status: &LanguageAgentStatus) -> bool {
    status.phase.as_deref() == Some(FAILED_PHASE)
        && status
            .condition(SYNTHESIZED_CONDITION)
            .is_some_and(|c| c.reason.as_deref() == Some(MAX_ATTEMPTS_REASON))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealingDecision {
    /// Nothing to do
    Idle,
    /// Eligible, but the backoff since the last synthesis has not elapsed
    Backoff { remaining: chrono::Duration },
    /// Attempts used up; the agent must be marked failed
    Exhausted,
    /// Run attempt number `attempt` (1-based)
    Attempt { attempt: i32 },
}

pub fn decide(
    config: &SelfHealingConfig,
    status: &LanguageAgentStatus,
    now: DateTime<Utc>,
) -> HealingDecision {
    if is_exhausted(status) || !should_attempt_self_healing(config, status) {
        return HealingDecision::Idle;
    }
    if status.self_healing_attempts >= config.max_attempts {
        return HealingDecision::Exhausted;
    }

    if let Some(last) = status
        .synthesis_info
        .as_ref()
        .and_then(SynthesisInfo::last_synthesis_at)
    {
        let minutes = backoff_minutes(status.self_healing_attempts, config.max_backoff_minutes);
        let backoff = chrono::Duration::minutes(i64::try_from(minutes).unwrap_or(i64::MAX));
        let elapsed = now - last;
        if elapsed < backoff {
            return HealingDecision::Backoff {
                remaining: backoff - elapsed,
            };
        }
    }

    HealingDecision::Attempt {
        attempt: status.self_healing_attempts + 1,
    }
}

/// Error context handed to the synthesizer
pub fn build_error_context(status: &LanguageAgentStatus) -> ErrorContext {
    ErrorContext {
        runtime_errors: status.runtime_errors.clone(),
        validation_errors: status
            .synthesis_info
            .as_ref()
            .map(|info| info.validation_errors.clone())
            .unwrap_or_default(),
        last_crash_log: status.last_crash_log.clone().unwrap_or_default(),
        consecutive_failures: status.consecutive_failures,
        previous_attempts: status.self_healing_attempts,
    }
}

/// Mark the agent failed after the attempt cap
pub fn mark_exhausted(status: &mut LanguageAgentStatus, max_attempts: i32, now: DateTime<Utc>) {
    let message = format!("Self-healing failed after {max_attempts} attempts");
    status.phase = Some(FAILED_PHASE.to_string());
    status.message = Some(message.clone());
    status.reason = Some(MAX_ATTEMPTS_REASON.to_string());
    status.set_condition(AgentCondition {
        condition_type: SYNTHESIZED_CONDITION.to_string(),
        status: "False".to_string(),
        last_transition_time: Some(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
        reason: Some(MAX_ATTEMPTS_REASON.to_string()),
        message: Some(message),
    });
}

/// Merge patch body for the agent status
pub fn status_patch(status: &LanguageAgentStatus) -> serde_json::Value {
    json!({ "status": status })
}

/// What one supervisor pass produced
#[derive(Debug, Clone, PartialEq)]
pub enum HealingOutcome {
    Idle,
    Backoff,
    Started(PendingRollout),
}

pub struct SelfHealingSupervisor {
    client: Client,
    namespace: String,
    config: SelfHealingConfig,
    retention: RetentionConfig,
    rollout_timeout: Duration,
    synthesizer: Arc<dyn Synthesizer>,
    artifacts: Arc<dyn ArtifactStore>,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<LearningMetrics>,
}

impl SelfHealingSupervisor {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        namespace: &str,
        config: SelfHealingConfig,
        retention: RetentionConfig,
        rollout_timeout: Duration,
        synthesizer: Arc<dyn Synthesizer>,
        artifacts: Arc<dyn ArtifactStore>,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<LearningMetrics>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            config,
            retention,
            rollout_timeout,
            synthesizer,
            artifacts,
            events,
            metrics,
        }
    }

    /// One supervisor pass. With `rollout_in_flight` set, failures are still
    /// recorded but no new attempt starts.
    #[instrument(skip(self, agent), fields(agent = %agent.name_any()))]
    pub async fn run(
        &self,
        agent: &LanguageAgent,
        rollout_in_flight: bool,
        now: DateTime<Utc>,
    ) -> Result<HealingOutcome> {
        if !self.config.enabled {
            return Ok(HealingOutcome::Idle);
        }

        let mut status = agent.status.clone().unwrap_or_default();
        if is_exhausted(&status) {
            debug!("Self-healing exhausted, waiting for manual intervention");
            return Ok(HealingOutcome::Idle);
        }

        let scan = self.detect_pod_failures(agent, &mut status, now).await?;
        if scan.changed() {
            self.patch_status(agent, &status).await?;
        }
        for (pod, message) in &scan.new_failures {
            self.events
                .publish(
                    agent,
                    AuditEvent::warning("RuntimeError", format!("Pod {pod} failed: {message}")),
                )
                .await;
        }

        if rollout_in_flight {
            return Ok(HealingOutcome::Idle);
        }

        match decide(&self.config, &status, now) {
            HealingDecision::Idle => Ok(HealingOutcome::Idle),
            HealingDecision::Backoff { remaining } => {
                debug!(remaining_seconds = remaining.num_seconds(), "In backoff period, skipping synthesis");
                Ok(HealingOutcome::Backoff)
            }
            HealingDecision::Exhausted => {
                warn!(max_attempts = self.config.max_attempts, "Max self-healing attempts reached, marking agent as failed");
                mark_exhausted(&mut status, self.config.max_attempts, now);
                self.patch_status(agent, &status).await?;
                self.events
                    .publish(
                        agent,
                        AuditEvent::warning(
                            "SelfHealingMaxAttempts",
                            format!(
                                "Self-healing max attempts ({}) reached, agent marked as failed",
                                self.config.max_attempts
                            ),
                        ),
                    )
                    .await;
                Err(Error::SelfHealingExhausted {
                    attempts: status.self_healing_attempts,
                })
            }
            HealingDecision::Attempt { attempt } => self.attempt(agent, status, attempt, now).await,
        }
    }

    async fn detect_pod_failures(
        &self,
        agent: &LanguageAgent,
        status: &mut LanguageAgentStatus,
        now: DateTime<Utc>,
    ) -> Result<FailureScan> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let selector = format!("{AGENT_LABEL}={}", agent.name_any());
        let listed = pods.list(&ListParams::default().labels(&selector)).await?;

        let mut logs = std::collections::BTreeMap::new();
        for pod in listed.items.iter().filter(|p| is_pod_failed(p)) {
            if let Some(log) = self.crash_log(&pods, pod).await {
                logs.insert(pod.name_any(), log);
            }
        }

        Ok(record_pod_failures(
            status,
            &listed.items,
            &|pod: &Pod| logs.get(&pod.name_any()).cloned(),
            self.config.runtime_error_history,
            now,
        ))
    }

    /// Tail of the previous agent container's output
    async fn crash_log(&self, pods: &Api<Pod>, pod: &Pod) -> Option<String> {
        let params = LogParams {
            container: Some(AGENT_CONTAINER_NAME.to_string()),
            tail_lines: Some(CRASH_LOG_TAIL_LINES),
            previous: true,
            ..Default::default()
        };
        match pods.logs(&pod.name_any(), &params).await {
            Ok(log) if !log.trim().is_empty() => Some(log),
            Ok(_) => None,
            Err(e) => {
                debug!(pod = %pod.name_any(), error = %e, "Crash log unavailable");
                None
            }
        }
    }

    async fn attempt(
        &self,
        agent: &LanguageAgent,
        mut status: LanguageAgentStatus,
        attempt: i32,
        now: DateTime<Utc>,
    ) -> Result<HealingOutcome> {
        info!(
            attempt,
            max_attempts = self.config.max_attempts,
            consecutive_failures = status.consecutive_failures,
            "Triggering self-healing synthesis"
        );
        self.events
            .publish(
                agent,
                AuditEvent::normal(
                    "SelfHealingTriggered",
                    format!(
                        "Self-healing synthesis triggered after {} consecutive failures (attempt {attempt}/{})",
                        status.consecutive_failures, self.config.max_attempts
                    ),
                ),
            )
            .await;
        self.metrics.record_self_healing_attempt();

        let request = SynthesisRequest {
            instructions: agent.spec.instructions.clone(),
            tools: agent.spec.tool_refs.clone(),
            models: agent.spec.model_refs.clone(),
            persona_text: agent.spec.persona.clone(),
            agent_name: agent.name_any(),
            namespace: agent.namespace().unwrap_or_default(),
            error_context: Some(build_error_context(&status)),
            is_retry: true,
            attempt_number: attempt,
            last_known_good_code: status.last_successful_code.clone(),
        };

        // the attempt and its start time are persisted before synthesis so a
        // failed call still backs off
        status.self_healing_attempts = attempt;
        let info = status.synthesis_info.get_or_insert_with(SynthesisInfo::default);
        info.last_synthesis_time = Some(now.to_rfc3339_opts(SecondsFormat::Secs, true));
        info.synthesis_attempts += 1;

        let response = match self.synthesizer.synthesize_agent(request).await {
            Ok(response) => response,
            Err(e) => {
                self.patch_status(agent, &status).await?;
                self.events
                    .publish(
                        agent,
                        AuditEvent::warning(
                            "SelfHealingSynthesisFailed",
                            format!("Self-healing synthesis failed: {e}"),
                        ),
                    )
                    .await;
                return Err(e.into());
            }
        };

        let info = status.synthesis_info.get_or_insert_with(SynthesisInfo::default);
        info.synthesis_duration = response.duration_seconds;
        info.validation_errors.clone_from(&response.validation_errors);

        if !response.validation_errors.is_empty() || response.dsl_code.trim().is_empty() {
            let errors = if response.validation_errors.is_empty() {
                vec!["synthesized code is empty".to_string()]
            } else {
                response.validation_errors
            };
            self.patch_status(agent, &status).await?;
            self.events
                .publish(
                    agent,
                    AuditEvent::warning(
                        "SelfHealingValidationFailed",
                        format!("Self-healing validation failed: {}", errors.join("; ")),
                    ),
                )
                .await;
            return Err(Error::ValidationFailed(errors));
        }

        if let Some(info) = status.synthesis_info.as_mut() {
            info.code_hash = Some(code_hash(&response.dsl_code));
        }
        self.patch_status(agent, &status).await?;

        let (artifact, version) = publish_artifact(
            self.artifacts.as_ref(),
            agent,
            &self.retention,
            response.dsl_code,
            SynthesisType::Healed,
            None,
            "error-recovery",
        )
        .await?;

        info!(artifact = %artifact, version, attempt, "Self-healing synthesis completed");
        self.events
            .publish(
                agent,
                AuditEvent::normal(
                    "SelfHealingSynthesisSucceeded",
                    format!(
                        "Self-healing synthesis succeeded in {:.2}s (attempt {attempt})",
                        response.duration_seconds
                    ),
                ),
            )
            .await;

        Ok(HealingOutcome::Started(new_pending_rollout(
            artifact,
            version,
            RolloutOrigin::SelfHealing { attempt },
            now,
            self.rollout_timeout,
        )))
    }

    async fn patch_status(&self, agent: &LanguageAgent, status: &LanguageAgentStatus) -> Result<()> {
        let api: Api<LanguageAgent> = Api::namespaced(self.client.clone(), &self.namespace);
        let patch = status_patch(status);
        api.patch_status(&agent.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
