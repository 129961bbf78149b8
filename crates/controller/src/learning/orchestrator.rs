//! # Learning Orchestrator
//!
//! Turns a fired [`LearningEvent`] into a published code artifact and a
//! [`PendingRollout`]. Task state is only committed once the rollout reports
//! `Healthy`; see [`LearningOrchestrator::complete`].

use super::analyzer::analyze_task_patterns;
use super::failures::{build_error_context, TaskFailure};
use super::fallback::generate_learned_code;
use super::status::LearningRecord;
use super::triggers::{LearningEvent, TriggerKind};
use super::TaskTrace;
use crate::artifacts::{ArtifactOptions, ArtifactStore, RetentionPolicy, SynthesisType};
use crate::crds::{LanguageAgent, RuntimeError};
use crate::events::{AuditEvent, EventPublisher};
use crate::metrics::LearningMetrics;
use crate::rollout::{new_pending_rollout, PendingRollout, RolloutOrigin};
use crate::synthesis::{ErrorContext, SynthesisError, SynthesisRequest, Synthesizer};
use crate::tasks::config::{LearningConfig, RetentionConfig};
use crate::tasks::types::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Runtime errors forwarded to the synthesizer per request
const MAX_FORWARDED_FAILURES: usize = 5;

/// Result of processing one trigger
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// Re-checks at process time rejected the trigger
    Skipped(&'static str),
    /// Artifact published; the rollout still has to run
    Started(PendingRollout),
}

/// Artifact version plus the `previous-version` label value
pub(crate) async fn publish_artifact(
    artifacts: &dyn ArtifactStore,
    agent: &LanguageAgent,
    retention: &RetentionConfig,
    code: String,
    synthesis_type: SynthesisType,
    learned_task: Option<String>,
    learning_source: &str,
) -> Result<(String, u32)> {
    let version = artifacts.next_version(agent).await?;
    let options = ArtifactOptions {
        code,
        version,
        synthesis_type,
        previous_version: Some(version - 1).filter(|v| *v > 0),
        learned_task,
        learning_source: learning_source.to_string(),
    };
    let name = artifacts.create_versioned_artifact(agent, options).await?;

    if retention.max_versions > 0 {
        let policy = RetentionPolicy {
            keep_last_n: retention.max_versions,
            always_keep_initial: true,
            cleanup_after_days: retention.cleanup_after_days,
        };
        if let Err(e) = artifacts.apply_retention_policy(agent, policy).await {
            error!(agent = %agent.name_any(), "Failed to apply retention policy: {}", e);
        }
    }

    Ok((name, version))
}

pub struct LearningOrchestrator {
    config: LearningConfig,
    retention: RetentionConfig,
    rollout_timeout: Duration,
    synthesizer: Arc<dyn Synthesizer>,
    artifacts: Arc<dyn ArtifactStore>,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<LearningMetrics>,
}

impl LearningOrchestrator {
    #[must_use]
    pub fn new(
        config: LearningConfig,
        retention: RetentionConfig,
        rollout_timeout: Duration,
        synthesizer: Arc<dyn Synthesizer>,
        artifacts: Arc<dyn ArtifactStore>,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<LearningMetrics>,
    ) -> Self {
        Self {
            config,
            retention,
            rollout_timeout,
            synthesizer,
            artifacts,
            events,
            metrics,
        }
    }

    /// Generate and publish code for `trigger`.
    ///
    /// The attempt is recorded on the task before any external call, so a
    /// failure still starts the cooldown.
    #[instrument(skip(self, agent, record, traces, failures), fields(agent = %agent.name_any(), task = %trigger.task, trigger = %trigger.kind))]
    pub async fn process_trigger(
        &self,
        agent: &LanguageAgent,
        record: &mut LearningRecord,
        trigger: &LearningEvent,
        traces: &[TaskTrace],
        failures: &[TaskFailure],
        now: DateTime<Utc>,
    ) -> Result<TriggerOutcome> {
        info!("Processing learning trigger");

        let status = record.get_or_insert(&trigger.task);
        if status.in_cooldown(self.config.learning_interval(), now) {
            debug!("Learning cooldown active, skipping");
            return Ok(TriggerOutcome::Skipped("cooldown"));
        }
        if trigger.confidence < self.config.pattern_confidence_min {
            debug!(
                confidence = trigger.confidence,
                threshold = self.config.pattern_confidence_min,
                "Pattern confidence below threshold, skipping"
            );
            return Ok(TriggerOutcome::Skipped("confidence"));
        }

        status.last_learning_attempt = Some(now);
        status.learning_attempts += 1;
        if trigger.kind == TriggerKind::ConsecutiveFailures {
            status.error_resynthesis_attempts += 1;
        }
        let error_attempts = status.error_resynthesis_attempts;
        let failure_streak = status.consecutive_failures;

        let code = self
            .generate_code(agent, trigger, traces, failures, error_attempts, failure_streak)
            .await?;

        let (artifact, version) = publish_artifact(
            self.artifacts.as_ref(),
            agent,
            &self.retention,
            code,
            SynthesisType::Learned,
            Some(trigger.task.clone()),
            trigger.kind.as_str(),
        )
        .await?;

        info!(artifact = %artifact, version, "Published learned artifact");

        let origin = RolloutOrigin::Learning {
            task: trigger.task.clone(),
            trigger: trigger.kind,
            confidence: trigger.confidence,
        };
        Ok(TriggerOutcome::Started(new_pending_rollout(
            artifact,
            version,
            origin,
            now,
            self.rollout_timeout,
        )))
    }

    async fn generate_code(
        &self,
        agent: &LanguageAgent,
        trigger: &LearningEvent,
        traces: &[TaskTrace],
        failures: &[TaskFailure],
        error_attempts: u32,
        failure_streak: u32,
    ) -> Result<String> {
        let analysis = analyze_task_patterns(&trigger.task, traces);
        let request = if trigger.kind == TriggerKind::ConsecutiveFailures {
            error_recovery_request(agent, trigger, failures, error_attempts, failure_streak)
        } else {
            pattern_request(agent, trigger, analysis.common_pattern.as_str())
        };

        match self.synthesizer.synthesize_agent(request).await {
            Ok(response) if !response.validation_errors.is_empty() => {
                warn!(
                    errors = response.validation_errors.len(),
                    "Synthesized code failed validation"
                );
                Err(Error::ValidationFailed(response.validation_errors))
            }
            Ok(response) if response.dsl_code.trim().is_empty() => Err(Error::ValidationFailed(
                vec!["synthesized code is empty".to_string()],
            )),
            Ok(response) => {
                debug!(
                    bytes = response.dsl_code.len(),
                    duration_seconds = response.duration_seconds,
                    "Synthesized learned code"
                );
                Ok(response.dsl_code)
            }
            Err(e @ SynthesisError::Rejected(_)) => Err(e.into()),
            Err(e) => {
                warn!(error = %e, "Synthesis service failed, using fallback pattern generation");
                self.events
                    .publish(
                        agent,
                        AuditEvent::warning(
                            "LearningSynthesisFallback",
                            format!(
                                "Synthesis unavailable for task {}, generated code from pattern {}: {}",
                                trigger.task, analysis.common_pattern, e
                            ),
                        ),
                    )
                    .await;
                Ok(generate_learned_code(&trigger.task, &analysis))
            }
        }
    }

    /// Commit a `Healthy` learning rollout to its task. Returns the new task version.
    pub async fn complete(
        &self,
        agent: &LanguageAgent,
        record: &mut LearningRecord,
        pending: &PendingRollout,
    ) -> Option<u32> {
        let RolloutOrigin::Learning {
            task,
            trigger,
            confidence,
        } = &pending.origin
        else {
            return None;
        };

        let new_version = commit_learning(record, pending)?;
        self.metrics
            .record_learning_outcome(&agent_key(agent), true);

        info!(
            agent = %agent.name_any(),
            task = %task,
            version = pending.version,
            task_version = new_version,
            "Learning rollout committed"
        );
        self.events
            .publish(
                agent,
                AuditEvent::normal(
                    "LearningSucceeded",
                    format!(
                        "Learned optimization for task {task} (v{}) with confidence {confidence:.2} from {trigger}",
                        pending.version
                    ),
                ),
            )
            .await;
        Some(new_version)
    }

    /// Report a failed learning attempt for `task`
    pub async fn report_failure(&self, agent: &LanguageAgent, task: &str, err: &Error) {
        self.metrics
            .record_learning_outcome(&agent_key(agent), false);
        error!(agent = %agent.name_any(), task = %task, "Learning failed: {}", err);
        self.events
            .publish(
                agent,
                AuditEvent::warning(
                    "LearningFailed",
                    format!("Failed to process learning for task {task}: {err}"),
                ),
            )
            .await;
    }
}

/// Apply the task-side effects of a healthy learning rollout
pub fn commit_learning(record: &mut LearningRecord, pending: &PendingRollout) -> Option<u32> {
    let RolloutOrigin::Learning {
        task, confidence, ..
    } = &pending.origin
    else {
        return None;
    };

    let status = record.get_or_insert(task);
    status.current_version += 1;
    status.artifact_version = Some(pending.version);
    status.is_symbolic = true;
    status.pattern_confidence = *confidence;
    Some(status.current_version)
}

fn agent_key(agent: &LanguageAgent) -> String {
    format!(
        "{}/{}",
        agent.namespace().unwrap_or_default(),
        agent.name_any()
    )
}

fn base_request(agent: &LanguageAgent, instructions: String) -> SynthesisRequest {
    SynthesisRequest {
        instructions,
        tools: agent.spec.tool_refs.clone(),
        models: agent.spec.model_refs.clone(),
        persona_text: agent.spec.persona.clone(),
        agent_name: agent.name_any(),
        namespace: agent.namespace().unwrap_or_default(),
        ..Default::default()
    }
}

fn pattern_request(agent: &LanguageAgent, trigger: &LearningEvent, pattern: &str) -> SynthesisRequest {
    base_request(
        agent,
        format!(
            "Optimize task {} based on {} execution traces with pattern: {pattern}",
            trigger.task, trigger.trace_count
        ),
    )
}

fn error_recovery_request(
    agent: &LanguageAgent,
    trigger: &LearningEvent,
    failures: &[TaskFailure],
    error_attempts: u32,
    failure_streak: u32,
) -> SynthesisRequest {
    let context_text = build_error_context(&trigger.task, failures);

    let mut newest: Vec<&TaskFailure> = failures.iter().collect();
    newest.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let runtime_errors = newest
        .into_iter()
        .take(MAX_FORWARDED_FAILURES)
        .map(|f| RuntimeError {
            timestamp: f.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            error_type: f.error_type.clone(),
            error_message: f.error_message.clone(),
            stack_trace: vec![f.context.clone()],
            exit_code: 1,
            synthesis_attempt: i32::try_from(error_attempts).unwrap_or(i32::MAX),
            ..Default::default()
        })
        .collect();

    let attempts = i32::try_from(error_attempts).unwrap_or(i32::MAX);
    let mut request = base_request(
        agent,
        format!(
            "Fix task {} that has been failing. Error context: {context_text}",
            trigger.task
        ),
    );
    request.error_context = Some(ErrorContext {
        runtime_errors,
        validation_errors: Vec::new(),
        last_crash_log: context_text,
        consecutive_failures: i32::try_from(failure_streak).unwrap_or(i32::MAX),
        previous_attempts: attempts,
    });
    request.is_retry = true;
    request.attempt_number = attempts;
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::MockArtifactStore;
    use crate::crds::LanguageAgentSpec;
    use crate::events::testing::CollectingPublisher;
    use crate::learning::fixtures::trace;
    use crate::rollout::RolloutPhase;
    use crate::synthesis::{MockSynthesizer, SynthesisResponse};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 13, 0, 0).unwrap()
    }

    fn agent() -> LanguageAgent {
        let mut agent = LanguageAgent::new(
            "bot",
            LanguageAgentSpec {
                instructions: "Fetch and store data".to_string(),
                tool_refs: vec!["http".to_string()],
                ..Default::default()
            },
        );
        agent.metadata.namespace = Some("agents".to_string());
        agent
    }

    fn trigger(kind: TriggerKind, confidence: f64) -> LearningEvent {
        LearningEvent {
            agent: "bot".to_string(),
            task: "fetch".to_string(),
            kind,
            trace_count: 12,
            error_rate: 0.0,
            confidence,
            timestamp: now(),
        }
    }

    fn traces() -> Vec<TaskTrace> {
        (0..12)
            .map(|_| trace("fetch", true, &[("http", "get"), ("json", "parse")]))
            .collect()
    }

    fn store_expecting_version(version: u32) -> MockArtifactStore {
        let mut store = MockArtifactStore::new();
        store.expect_next_version().returning(move |_| Ok(version));
        store
            .expect_create_versioned_artifact()
            .returning(|_, options| Ok(format!("bot-v{}", options.version)));
        store.expect_apply_retention_policy().returning(|_, _| Ok(0));
        store
    }

    fn orchestrator(
        synth: MockSynthesizer,
        store: MockArtifactStore,
        events: Arc<CollectingPublisher>,
    ) -> LearningOrchestrator {
        LearningOrchestrator::new(
            LearningConfig::default(),
            RetentionConfig::default(),
            Duration::from_secs(300),
            Arc::new(synth),
            Arc::new(store),
            events,
            Arc::new(LearningMetrics::default()),
        )
    }

    #[tokio::test]
    async fn publishes_synthesized_code_and_starts_rollout() {
        let mut synth = MockSynthesizer::new();
        synth
            .expect_synthesize_agent()
            .withf(|req| {
                req.instructions
                    == "Optimize task fetch based on 12 execution traces with pattern: simple_tool_sequence"
                    && !req.is_retry
                    && req.tools == vec!["http".to_string()]
            })
            .times(1)
            .returning(|_| {
                Ok(SynthesisResponse {
                    dsl_code: "task :fetch do\nend\n".to_string(),
                    ..Default::default()
                })
            });

        let mut store = MockArtifactStore::new();
        store.expect_next_version().returning(|_| Ok(3));
        store
            .expect_create_versioned_artifact()
            .withf(|_, options| {
                options.version == 3
                    && options.previous_version == Some(2)
                    && options.synthesis_type == SynthesisType::Learned
                    && options.learned_task.as_deref() == Some("fetch")
                    && options.learning_source == "traces_accumulated"
                    && options.code.starts_with("task :fetch")
            })
            .times(1)
            .returning(|_, _| Ok("bot-v3".to_string()));
        store.expect_apply_retention_policy().times(1).returning(|_, _| Ok(0));

        let events = Arc::new(CollectingPublisher::default());
        let orch = orchestrator(synth, store, events.clone());
        let mut record = LearningRecord::default();

        let outcome = orch
            .process_trigger(
                &agent(),
                &mut record,
                &trigger(TriggerKind::TracesAccumulated, 0.9),
                &traces(),
                &[],
                now(),
            )
            .await
            .unwrap();

        let TriggerOutcome::Started(pending) = outcome else {
            panic!("expected a rollout");
        };
        assert_eq!(pending.phase, RolloutPhase::Patching);
        assert_eq!(pending.target_artifact, "bot-v3");
        assert_eq!(pending.version, 3);

        let status = record.get("fetch").unwrap();
        assert_eq!(status.learning_attempts, 1);
        assert_eq!(status.last_learning_attempt, Some(now()));
        assert_eq!(status.current_version, 1, "not committed before rollout");
        assert!(!status.is_symbolic);
        assert!(events.reasons().is_empty());
    }

    #[tokio::test]
    async fn synthesis_failure_falls_back_to_template() {
        let mut synth = MockSynthesizer::new();
        synth
            .expect_synthesize_agent()
            .returning(|_| Err(SynthesisError::Unavailable));

        let mut store = MockArtifactStore::new();
        store.expect_next_version().returning(|_| Ok(2));
        store
            .expect_create_versioned_artifact()
            .withf(|_, options| options.code.contains("task :fetch do |inputs|"))
            .times(1)
            .returning(|_, _| Ok("bot-v2".to_string()));
        store.expect_apply_retention_policy().returning(|_, _| Ok(0));

        let events = Arc::new(CollectingPublisher::default());
        let orch = orchestrator(synth, store, events.clone());
        let mut record = LearningRecord::default();

        let outcome = orch
            .process_trigger(
                &agent(),
                &mut record,
                &trigger(TriggerKind::TracesAccumulated, 0.9),
                &traces(),
                &[],
                now(),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, TriggerOutcome::Started(_)));
        assert_eq!(events.reasons(), vec!["LearningSynthesisFallback"]);
    }

    #[tokio::test]
    async fn validation_errors_fail_the_attempt_but_record_it() {
        let mut synth = MockSynthesizer::new();
        synth.expect_synthesize_agent().returning(|_| {
            Ok(SynthesisResponse {
                dsl_code: "task :fetch".to_string(),
                validation_errors: vec!["syntax error".to_string()],
                ..Default::default()
            })
        });

        let mut store = MockArtifactStore::new();
        store.expect_next_version().never();
        store.expect_create_versioned_artifact().never();

        let orch = orchestrator(synth, store, Arc::new(CollectingPublisher::default()));
        let mut record = LearningRecord::default();

        let err = orch
            .process_trigger(
                &agent(),
                &mut record,
                &trigger(TriggerKind::TracesAccumulated, 0.9),
                &traces(),
                &[],
                now(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ValidationFailed(ref e) if e == &vec!["syntax error".to_string()]));
        assert_eq!(record.get("fetch").unwrap().last_learning_attempt, Some(now()));
    }

    #[tokio::test]
    async fn rechecks_cooldown_and_confidence() {
        let mut synth = MockSynthesizer::new();
        synth.expect_synthesize_agent().never();
        let orch = orchestrator(synth, MockArtifactStore::new(), Arc::new(CollectingPublisher::default()));

        let mut record = LearningRecord::default();
        let outcome = orch
            .process_trigger(
                &agent(),
                &mut record,
                &trigger(TriggerKind::TracesAccumulated, 0.5),
                &traces(),
                &[],
                now(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, TriggerOutcome::Skipped("confidence"));
        assert_eq!(record.get("fetch").unwrap().learning_attempts, 0);

        record.get_or_insert("fetch").last_learning_attempt =
            Some(now() - chrono::Duration::seconds(30));
        let outcome = orch
            .process_trigger(
                &agent(),
                &mut record,
                &trigger(TriggerKind::TracesAccumulated, 0.9),
                &traces(),
                &[],
                now(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, TriggerOutcome::Skipped("cooldown"));
    }

    #[tokio::test]
    async fn consecutive_failures_send_error_context_with_tracked_streak() {
        let failures: Vec<TaskFailure> = (0..7)
            .map(|i| TaskFailure {
                task_name: "fetch".to_string(),
                timestamp: now() - chrono::Duration::minutes(i),
                error_message: "connection refused".to_string(),
                error_type: "failed".to_string(),
                context: "Event: BackOff/Pod".to_string(),
            })
            .collect();

        let mut synth = MockSynthesizer::new();
        synth
            .expect_synthesize_agent()
            .withf(|req| {
                let ctx = req.error_context.as_ref().unwrap();
                req.is_retry
                    && req.instructions.starts_with("Fix task fetch that has been failing.")
                    && ctx.runtime_errors.len() == 5
                    && ctx.runtime_errors[0].exit_code == 1
                    && ctx.runtime_errors[0].stack_trace == vec!["Event: BackOff/Pod".to_string()]
                    && ctx.consecutive_failures == 3
                    && ctx.previous_attempts == 1
                    && ctx.last_crash_log.contains("has encountered 7 recent failures")
            })
            .times(1)
            .returning(|_| {
                Ok(SynthesisResponse {
                    dsl_code: "task :fetch do\nend\n".to_string(),
                    ..Default::default()
                })
            });

        let orch = orchestrator(
            synth,
            store_expecting_version(2),
            Arc::new(CollectingPublisher::default()),
        );
        let mut record = LearningRecord::default();
        // the streak tracked on the task, not the size of the failure window
        record.get_or_insert("fetch").consecutive_failures = 3;

        let outcome = orch
            .process_trigger(
                &agent(),
                &mut record,
                &trigger(TriggerKind::ConsecutiveFailures, 0.8),
                &[],
                &failures,
                now(),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, TriggerOutcome::Started(_)));
        assert_eq!(record.get("fetch").unwrap().error_resynthesis_attempts, 1);
    }

    #[tokio::test]
    async fn healthy_rollout_commits_exactly_one_version() {
        let events = Arc::new(CollectingPublisher::default());
        let orch = orchestrator(MockSynthesizer::new(), MockArtifactStore::new(), events.clone());
        let mut record = LearningRecord::default();

        for (i, version) in [4_u32, 5, 6].into_iter().enumerate() {
            let mut pending = new_pending_rollout(
                format!("bot-v{version}"),
                version,
                RolloutOrigin::Learning {
                    task: "fetch".to_string(),
                    trigger: TriggerKind::TracesAccumulated,
                    confidence: 0.91,
                },
                now(),
                Duration::from_secs(300),
            );
            pending.phase = RolloutPhase::Healthy;

            let committed = orch.complete(&agent(), &mut record, &pending).await;
            assert_eq!(committed, Some(2 + i as u32));
        }

        let status = record.get("fetch").unwrap();
        assert_eq!(status.current_version, 4);
        assert_eq!(status.artifact_version, Some(6));
        assert!(status.is_symbolic);
        assert!((status.pattern_confidence - 0.91).abs() < f64::EPSILON);
        assert_eq!(
            events.events.lock().unwrap()[0].message,
            "Learned optimization for task fetch (v4) with confidence 0.91 from traces_accumulated"
        );
    }

    #[tokio::test]
    async fn self_healing_rollouts_do_not_touch_tasks() {
        let orch = orchestrator(
            MockSynthesizer::new(),
            MockArtifactStore::new(),
            Arc::new(CollectingPublisher::default()),
        );
        let mut record = LearningRecord::default();
        let pending = new_pending_rollout(
            "bot-v2".to_string(),
            2,
            RolloutOrigin::SelfHealing { attempt: 1 },
            now(),
            Duration::from_secs(300),
        );
        assert_eq!(orch.complete(&agent(), &mut record, &pending).await, None);
        assert!(record.is_empty());
    }
}
