//! Per-agent reconcile tying together self-healing, learning triggers and
//! rollout progress

use super::failures::list_task_failures;
use super::group_traces_by_task;
use super::orchestrator::{LearningOrchestrator, TriggerOutcome};
use super::status::{LearningRecord, LearningStatusStore};
use super::triggers::TriggerEvaluator;
use super::TaskTrace;
use crate::crds::LanguageAgent;
use crate::healing::{HealingOutcome, SelfHealingSupervisor};
use crate::rollout::{PendingRollout, RolloutController, RolloutError, RolloutOrigin, RolloutPhase};
use crate::tasks::config::ControllerConfig;
use crate::tasks::types::{Context, Error, Result, LEARNING_DISABLED_ANNOTATION};
use crate::telemetry::{spans_to_task_traces, SpanFilter, TimeRange};
use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Where the agent's in-flight rollout stands after one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RolloutStep {
    None,
    InFlight,
    Settled,
}

/// Whether learning is switched off globally or for this agent
pub fn learning_disabled(agent: &LanguageAgent, config: &ControllerConfig) -> bool {
    if !config.learning.enabled {
        return true;
    }
    agent
        .annotations()
        .get(LEARNING_DISABLED_ANNOTATION)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Requeue delay once a reconcile has finished its work
pub fn requeue_after(config: &ControllerConfig, record: &LearningRecord) -> Duration {
    if record.pending_rollout.is_some() {
        config.rollout.poll_interval()
    } else {
        config.learning.learning_interval()
    }
}

struct AgentReconciler<'a> {
    ctx: &'a Context,
    statuses: LearningStatusStore,
    evaluator: TriggerEvaluator,
    orchestrator: LearningOrchestrator,
    supervisor: SelfHealingSupervisor,
    rollouts: RolloutController,
}

impl<'a> AgentReconciler<'a> {
    fn new(ctx: &'a Context) -> Self {
        let config = &ctx.config;
        let rollout_timeout = config.rollout.timeout();
        Self {
            ctx,
            statuses: LearningStatusStore::new(ctx.client.clone(), &ctx.namespace),
            evaluator: TriggerEvaluator::new(config.learning.clone()),
            orchestrator: LearningOrchestrator::new(
                config.learning.clone(),
                config.retention.clone(),
                rollout_timeout,
                ctx.synthesizer.clone(),
                ctx.artifacts.clone(),
                ctx.events.clone(),
                ctx.metrics.clone(),
            ),
            supervisor: SelfHealingSupervisor::new(
                ctx.client.clone(),
                &ctx.namespace,
                config.self_healing.clone(),
                config.retention.clone(),
                rollout_timeout,
                ctx.synthesizer.clone(),
                ctx.artifacts.clone(),
                ctx.events.clone(),
                ctx.metrics.clone(),
            ),
            rollouts: RolloutController::new(
                ctx.client.clone(),
                &ctx.namespace,
                ctx.events.clone(),
            ),
        }
    }

    /// Advance the persisted rollout by one step and settle its outcome
    async fn step_rollout(
        &self,
        agent: &LanguageAgent,
        record: &mut LearningRecord,
        now: DateTime<Utc>,
    ) -> RolloutStep {
        let Some(mut pending) = record.pending_rollout.take() else {
            return RolloutStep::None;
        };

        match self.rollouts.advance(agent, &mut pending, now).await {
            Ok(()) if pending.phase == RolloutPhase::Healthy => {
                self.settle_healthy(agent, record, &pending).await;
                RolloutStep::Settled
            }
            Ok(()) => {
                record.pending_rollout = Some(pending);
                RolloutStep::InFlight
            }
            Err(e) if !pending.phase.is_terminal() => {
                warn!(target_artifact = %pending.target_artifact, error = %e, "Rollout step failed, retrying on next reconcile");
                record.pending_rollout = Some(pending);
                RolloutStep::InFlight
            }
            Err(e) => {
                self.settle_failed(agent, &pending, e).await;
                RolloutStep::Settled
            }
        }
    }

    /// Persist a freshly started rollout, then take its first step. The record
    /// is always saved before the workload is patched.
    async fn begin_rollout(
        &self,
        agent: &LanguageAgent,
        record: &mut LearningRecord,
        pending: PendingRollout,
        now: DateTime<Utc>,
    ) -> Result<RolloutStep> {
        record.pending_rollout = Some(pending);
        self.statuses.save(agent, record).await?;
        Ok(self.step_rollout(agent, record, now).await)
    }

    async fn settle_healthy(
        &self,
        agent: &LanguageAgent,
        record: &mut LearningRecord,
        pending: &PendingRollout,
    ) {
        match &pending.origin {
            RolloutOrigin::Learning { .. } => {
                self.orchestrator.complete(agent, record, pending).await;
            }
            RolloutOrigin::SelfHealing { attempt } => {
                info!(
                    agent = %agent.name_any(),
                    version = pending.version,
                    attempt,
                    "Self-healed code rolled out"
                );
            }
        }
    }

    async fn settle_failed(&self, agent: &LanguageAgent, pending: &PendingRollout, err: RolloutError) {
        if matches!(err, RolloutError::RolledBack { .. }) {
            self.ctx.metrics.record_rollback();
        }
        let err = Error::from(err);
        match &pending.origin {
            RolloutOrigin::Learning { task, .. } => {
                self.orchestrator.report_failure(agent, task, &err).await;
            }
            RolloutOrigin::SelfHealing { attempt } => {
                error!(agent = %agent.name_any(), attempt, "Self-healing rollout failed: {}", err);
            }
        }
    }

    /// Traces grouped by task, or nothing when the backend is unavailable
    async fn collect_traces(&self, agent_name: &str, now: DateTime<Utc>) -> BTreeMap<String, Vec<TaskTrace>> {
        let adapter = &self.ctx.traces;
        if !adapter.available().await {
            debug!(backend = adapter.name(), "Trace backend unavailable, skipping trace analysis");
            return BTreeMap::new();
        }

        let learning = &self.ctx.config.learning;
        let filter = SpanFilter {
            time_range: Some(TimeRange::trailing(
                Duration::from_secs(learning.trace_lookback_seconds),
                now,
            )),
            attributes: BTreeMap::from([("agent.name".to_string(), agent_name.to_string())]),
            limit: learning.trace_query_limit,
            ..Default::default()
        };

        match adapter.query_spans(&filter).await {
            Ok(spans) => {
                let traces = spans_to_task_traces(&spans);
                debug!(spans = spans.len(), traces = traces.len(), "Converted spans to task traces");
                group_traces_by_task(traces)
            }
            Err(e) => {
                warn!(backend = adapter.name(), error = %e, "Failed to query traces");
                BTreeMap::new()
            }
        }
    }

    /// Evaluate triggers and start at most one learning rollout
    async fn run_learning(
        &self,
        agent: &LanguageAgent,
        record: &mut LearningRecord,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let agent_name = agent.name_any();
        let learning = &self.ctx.config.learning;

        let traces = self.collect_traces(&agent_name, now).await;
        let mut triggers = self
            .evaluator
            .evaluate_traces(&agent_name, record, &traces, now);

        let failures = list_task_failures(
            self.ctx.client.clone(),
            &self.ctx.namespace,
            &agent_name,
            Duration::from_secs(learning.event_lookback_seconds),
            now,
        )
        .await?;
        triggers.extend(
            self.evaluator
                .evaluate_failures(&agent_name, record, &failures, now),
        );

        for trigger in &triggers {
            self.ctx.metrics.record_trigger(trigger.kind.as_str());
        }
        if !triggers.is_empty() {
            info!(agent = %agent_name, triggers = triggers.len(), "Learning triggers fired");
        }

        for trigger in &triggers {
            let task_traces = traces.get(&trigger.task).map_or(&[][..], Vec::as_slice);
            let task_failures = failures.get(&trigger.task).map_or(&[][..], Vec::as_slice);

            match self
                .orchestrator
                .process_trigger(agent, record, trigger, task_traces, task_failures, now)
                .await
            {
                Ok(TriggerOutcome::Skipped(reason)) => {
                    debug!(task = %trigger.task, reason, "Trigger skipped");
                }
                Ok(TriggerOutcome::Started(pending)) => {
                    self.begin_rollout(agent, record, pending, now).await?;
                    break;
                }
                Err(e) => {
                    self.orchestrator.report_failure(agent, &trigger.task, &e).await;
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Reconcile one `LanguageAgent`.
///
/// Order: advance any in-flight rollout, run the self-healing supervisor, then
/// evaluate learning triggers. A new trigger is only processed when no rollout
/// is pending for the agent.
#[instrument(skip(agent, ctx), fields(name = %agent.name_any(), namespace = %ctx.namespace))]
pub async fn reconcile_language_agent(agent: Arc<LanguageAgent>, ctx: Arc<Context>) -> Result<Action> {
    let config = ctx.config.clone();
    let learning_off = learning_disabled(&agent, &config);
    if learning_off && !config.self_healing.enabled {
        debug!("Learning and self-healing disabled for agent");
        return Ok(Action::await_change());
    }

    let now = Utc::now();
    let reconciler = AgentReconciler::new(&ctx);
    let mut record = reconciler.statuses.load(&agent).await?;

    let mut rollout = reconciler.step_rollout(&agent, &mut record, now).await;

    let healing = reconciler
        .supervisor
        .run(&agent, rollout == RolloutStep::InFlight, now)
        .await;
    match healing {
        Ok(HealingOutcome::Started(pending)) => {
            rollout = reconciler.begin_rollout(&agent, &mut record, pending, now).await?;
        }
        Ok(HealingOutcome::Idle | HealingOutcome::Backoff) => {}
        Err(e @ Error::SelfHealingExhausted { .. }) => {
            reconciler.statuses.save(&agent, &record).await?;
            return Err(e);
        }
        Err(e) => {
            warn!(error = %e, "Self-healing pass failed");
        }
    }

    if learning_off {
        debug!("Learning disabled for agent");
    } else if rollout == RolloutStep::InFlight {
        debug!("Rollout in flight, deferring learning triggers");
    } else if let Err(e) = reconciler.run_learning(&agent, &mut record, now).await {
        reconciler.statuses.save(&agent, &record).await?;
        return Err(e);
    }

    reconciler.statuses.save(&agent, &record).await?;

    let requeue = requeue_after(&config, &record);
    debug!(requeue_seconds = requeue.as_secs(), "Reconcile complete");
    Ok(Action::requeue(requeue))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::TriggerKind;
    use crate::rollout::new_pending_rollout;
    use crate::LanguageAgentSpec;
    use std::collections::BTreeMap;

    fn agent(annotations: &[(&str, &str)]) -> LanguageAgent {
        let mut agent = LanguageAgent::new("bot", LanguageAgentSpec::default());
        agent.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<BTreeMap<_, _>>(),
        );
        agent
    }

    #[test]
    fn learning_enabled_by_default() {
        assert!(!learning_disabled(&agent(&[]), &ControllerConfig::default()));
    }

    #[test]
    fn annotation_disables_learning() {
        let config = ControllerConfig::default();
        assert!(learning_disabled(
            &agent(&[(LEARNING_DISABLED_ANNOTATION, "true")]),
            &config
        ));
        assert!(learning_disabled(
            &agent(&[(LEARNING_DISABLED_ANNOTATION, "TRUE")]),
            &config
        ));
        assert!(!learning_disabled(
            &agent(&[(LEARNING_DISABLED_ANNOTATION, "false")]),
            &config
        ));
    }

    #[test]
    fn global_switch_disables_learning() {
        let mut config = ControllerConfig::default();
        config.learning.enabled = false;
        assert!(learning_disabled(&agent(&[]), &config));
    }

    #[test]
    fn requeue_uses_poll_interval_while_rollout_pending() {
        let config = ControllerConfig::default();
        let mut record = LearningRecord::default();
        assert_eq!(
            requeue_after(&config, &record),
            config.learning.learning_interval()
        );

        record.pending_rollout = Some(new_pending_rollout(
            "bot-v2".to_string(),
            2,
            RolloutOrigin::Learning {
                task: "fetch".to_string(),
                trigger: TriggerKind::TracesAccumulated,
                confidence: 0.9,
            },
            Utc::now(),
            config.rollout.timeout(),
        ));
        assert_eq!(requeue_after(&config, &record), config.rollout.poll_interval());
    }

    mod reconcile {
        use super::*;
        use crate::artifacts::MockArtifactStore;
        use crate::crds::LanguageAgentStatus;
        use crate::events::testing::CollectingPublisher;
        use crate::metrics::LearningMetrics;
        use crate::rollout::{WorkloadKind, WorkloadRef};
        use crate::synthesis::MockSynthesizer;
        use crate::telemetry::MockTraceAdapter;
        use crate::test_apiserver::{list, mock_client, not_found, received, status_error, NAMESPACE};
        use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
        use k8s_openapi::api::core::v1::{ConfigMap, Pod, PodSpec, PodTemplateSpec};
        use kube::api::ObjectMeta;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        const STATUS_CONFIGMAP: &str = "/api/v1/namespaces/agents/configmaps/bot-learning-status";
        const CONFIGMAPS: &str = "/api/v1/namespaces/agents/configmaps";
        const PODS: &str = "/api/v1/namespaces/agents/pods";
        const EVENTS: &str = "/api/v1/namespaces/agents/events";
        const DEPLOYMENTS: &str = "/apis/apps/v1/namespaces/agents/deployments";
        const DEPLOYMENT: &str = "/apis/apps/v1/namespaces/agents/deployments/bot";

        fn namespaced_agent(status: Option<LanguageAgentStatus>) -> LanguageAgent {
            let mut agent = LanguageAgent::new("bot", LanguageAgentSpec::default());
            agent.metadata.namespace = Some(NAMESPACE.to_string());
            agent.metadata.uid = Some("0c7d8a4e-5f1b-4c1e-9a55-3f0d2b6e7a10".to_string());
            agent.status = status;
            agent
        }

        /// Trace backend that must not be consulted
        fn untouched_traces() -> MockTraceAdapter {
            let mut traces = MockTraceAdapter::new();
            traces.expect_available().never();
            traces.expect_query_spans().never();
            traces.expect_name().return_const("mock");
            traces
        }

        fn context(server: &MockServer, events: &Arc<CollectingPublisher>) -> Arc<Context> {
            Arc::new(Context {
                client: mock_client(server),
                namespace: NAMESPACE.to_string(),
                config: Arc::new(ControllerConfig::default()),
                synthesizer: Arc::new(MockSynthesizer::new()),
                artifacts: Arc::new(MockArtifactStore::new()),
                traces: Arc::new(untouched_traces()),
                events: events.clone(),
                metrics: Arc::new(LearningMetrics::default()),
            })
        }

        async fn mount_status_save(server: &MockServer) {
            Mock::given(method("POST"))
                .and(path(CONFIGMAPS))
                .respond_with(ResponseTemplate::new(201).set_body_json(ConfigMap {
                    metadata: ObjectMeta {
                        name: Some("bot-learning-status".to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                }))
                .expect(1)
                .mount(server)
                .await;
        }

        async fn mount_no_pods(server: &MockServer) {
            Mock::given(method("GET"))
                .and(path(PODS))
                .respond_with(list::<Pod>("v1", "PodList", &[]))
                .mount(server)
                .await;
        }

        async fn mount_no_failure_scan(server: &MockServer) {
            Mock::given(method("GET"))
                .and(path(EVENTS))
                .respond_with(ResponseTemplate::new(200))
                .expect(0)
                .mount(server)
                .await;
        }

        #[tokio::test]
        async fn rollout_in_flight_defers_learning() {
            let server = MockServer::start().await;
            let mut pending = new_pending_rollout(
                "bot-v2".to_string(),
                2,
                RolloutOrigin::Learning {
                    task: "fetch".to_string(),
                    trigger: TriggerKind::TracesAccumulated,
                    confidence: 0.9,
                },
                Utc::now(),
                Duration::from_secs(3600),
            );
            pending.phase = RolloutPhase::Waiting;
            pending.workload = Some(WorkloadRef::new(WorkloadKind::Deployment, "bot"));
            pending.original_artifact = Some("bot-v1".to_string());

            let mut record = LearningRecord::default();
            record.pending_rollout = Some(pending);
            Mock::given(method("GET"))
                .and(path(STATUS_CONFIGMAP))
                .respond_with(ResponseTemplate::new(200).set_body_json(ConfigMap {
                    metadata: ObjectMeta {
                        name: Some("bot-learning-status".to_string()),
                        ..Default::default()
                    },
                    data: Some(record.to_data().unwrap()),
                    ..Default::default()
                }))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path(DEPLOYMENT))
                .respond_with(ResponseTemplate::new(200).set_body_json(Deployment {
                    metadata: ObjectMeta {
                        name: Some("bot".to_string()),
                        generation: Some(4),
                        ..Default::default()
                    },
                    spec: Some(DeploymentSpec {
                        replicas: Some(2),
                        ..Default::default()
                    }),
                    status: Some(DeploymentStatus {
                        observed_generation: Some(4),
                        updated_replicas: Some(1),
                        ready_replicas: Some(1),
                        available_replicas: Some(1),
                        unavailable_replicas: Some(1),
                        ..Default::default()
                    }),
                }))
                .mount(&server)
                .await;
            mount_no_pods(&server).await;
            mount_no_failure_scan(&server).await;
            mount_status_save(&server).await;

            let events = Arc::new(CollectingPublisher::default());
            let ctx = context(&server, &events);
            let action = reconcile_language_agent(Arc::new(namespaced_agent(None)), ctx.clone())
                .await
                .unwrap();

            assert_eq!(action, Action::requeue(ctx.config.rollout.poll_interval()));
            assert!(events.reasons().is_empty());

            let saved: Vec<ConfigMap> = received(&server, "POST").await;
            let (saved_record, errors) = LearningRecord::from_data(saved[0].data.as_ref().unwrap());
            assert!(errors.is_empty());
            assert_eq!(
                saved_record.pending_rollout.map(|p| p.phase),
                Some(RolloutPhase::Waiting)
            );
        }

        fn learning_rollout() -> PendingRollout {
            new_pending_rollout(
                "bot-v2".to_string(),
                2,
                RolloutOrigin::Learning {
                    task: "fetch".to_string(),
                    trigger: TriggerKind::ErrorThreshold,
                    confidence: 0.85,
                },
                Utc::now(),
                Duration::from_secs(300),
            )
        }

        #[tokio::test]
        async fn started_rollout_is_saved_before_the_workload_is_patched() {
            let server = MockServer::start().await;
            let live = Deployment {
                metadata: ObjectMeta {
                    name: Some("bot".to_string()),
                    ..Default::default()
                },
                spec: Some(DeploymentSpec {
                    template: PodTemplateSpec {
                        metadata: None,
                        spec: Some(PodSpec::default()),
                    },
                    ..Default::default()
                }),
                status: None,
            };
            mount_status_save(&server).await;
            Mock::given(method("GET"))
                .and(path(DEPLOYMENTS))
                .respond_with(list("apps/v1", "DeploymentList", &[live.clone()]))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path(DEPLOYMENT))
                .respond_with(ResponseTemplate::new(200).set_body_json(&live))
                .mount(&server)
                .await;
            Mock::given(method("PUT"))
                .and(path(DEPLOYMENT))
                .respond_with(ResponseTemplate::new(200).set_body_json(&live))
                .expect(1)
                .mount(&server)
                .await;

            let events = Arc::new(CollectingPublisher::default());
            let ctx = context(&server, &events);
            let reconciler = AgentReconciler::new(&ctx);
            let mut record = LearningRecord::default();

            let step = reconciler
                .begin_rollout(&namespaced_agent(None), &mut record, learning_rollout(), Utc::now())
                .await
                .unwrap();
            assert_eq!(step, RolloutStep::InFlight);

            let requests = server.received_requests().await.unwrap();
            let position = |verb: &str| requests.iter().position(|r| r.method.as_str() == verb);
            assert!(position("POST").unwrap() < position("PUT").unwrap());

            let saved: Vec<ConfigMap> = received(&server, "POST").await;
            let (saved_record, _) = LearningRecord::from_data(saved[0].data.as_ref().unwrap());
            assert_eq!(
                saved_record.pending_rollout.map(|p| p.phase),
                Some(RolloutPhase::Patching)
            );
        }

        #[tokio::test]
        async fn failed_save_leaves_the_workload_untouched() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path(CONFIGMAPS))
                .respond_with(status_error(500, "InternalError", "etcdserver: request timed out"))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path(DEPLOYMENTS))
                .respond_with(ResponseTemplate::new(200))
                .expect(0)
                .mount(&server)
                .await;

            let events = Arc::new(CollectingPublisher::default());
            let ctx = context(&server, &events);
            let reconciler = AgentReconciler::new(&ctx);
            let mut record = LearningRecord::default();

            let err = reconciler
                .begin_rollout(&namespaced_agent(None), &mut record, learning_rollout(), Utc::now())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::KubeError(_)));
            assert_eq!(
                record.pending_rollout.map(|p| p.phase),
                Some(RolloutPhase::Patching)
            );
        }

        #[tokio::test]
        async fn exhausted_self_healing_saves_status_then_fails() {
            let server = MockServer::start().await;
            let agent = namespaced_agent(Some(LanguageAgentStatus {
                consecutive_failures: 2,
                self_healing_attempts: 5,
                ..Default::default()
            }));

            Mock::given(method("GET"))
                .and(path(STATUS_CONFIGMAP))
                .respond_with(not_found("configmaps", "bot-learning-status"))
                .mount(&server)
                .await;
            Mock::given(method("PATCH"))
                .and(path("/apis/langop.io/v1alpha1/namespaces/agents/languageagents/bot/status"))
                .respond_with(ResponseTemplate::new(200).set_body_json(&agent))
                .expect(1)
                .mount(&server)
                .await;
            mount_no_pods(&server).await;
            mount_no_failure_scan(&server).await;
            mount_status_save(&server).await;

            let events = Arc::new(CollectingPublisher::default());
            let err = reconcile_language_agent(Arc::new(agent), context(&server, &events))
                .await
                .unwrap_err();

            assert!(matches!(err, Error::SelfHealingExhausted { attempts: 5 }));
            assert_eq!(events.reasons(), vec!["SelfHealingMaxAttempts"]);

            let patched: Vec<serde_json::Value> = received(&server, "PATCH").await;
            assert_eq!(patched[0]["status"]["phase"], "Failed");
        }
    }
}
