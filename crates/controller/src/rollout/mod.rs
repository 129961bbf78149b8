//! # Rollout
//!
//! Moves an agent's workload onto a new code artifact without blocking the
//! reconcile. A [`PendingRollout`] is persisted with the agent's learning state
//! and advanced one step per reconcile:
//!
//! ```text
//! Patching ──► Waiting ──► Healthy
//!    │            ├──────► RolledBack   (deadline passed, original restored)
//!    └────────────┴──────► Failed       (rollback failed, health check failed or workload deleted)
//! ```
//!
//! Workload kinds without rolling updates go straight from `Patching` to `Healthy`.

use crate::crds::LanguageAgent;
use crate::events::{AuditEvent, EventPublisher};
use crate::learning::TriggerKind;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::Api;
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

pub mod health;
pub mod references;
pub mod workload;

pub use health::{evaluate_wait, ReplicaCounts, WaitOutcome};
pub use references::{artifact_name, artifact_version, rewrite_artifact_refs};
pub use workload::{locate_workload, update_workload, TemplateUpdate};

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("Kubernetes API error during rollout: {0}")]
    Kube(#[from] kube::Error),

    #[error("workload {workload} has a malformed status: missing {field}")]
    MalformedStatus { workload: String, field: String },

    #[error("workload {workload} has no pod template")]
    MissingPodTemplate { workload: String },

    #[error("workload {workload} was deleted during rollout")]
    WorkloadGone { workload: String },

    #[error("rollout of {target} could not be started before its deadline")]
    DeadlineExceeded { target: String },

    #[error("deployment rollout failed, rolled back: {workload} did not converge in time")]
    RolledBack { workload: String },

    #[error("deployment update failed and rollback failed: {source}")]
    RollbackFailed {
        workload: String,
        #[source]
        source: Box<RolloutError>,
    },

    #[error("deployment health check failed for {workload}: {reason}")]
    Unhealthy { workload: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RolloutPhase {
    Patching,
    Waiting,
    Healthy,
    RolledBack,
    Failed,
}

impl RolloutPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RolloutPhase::Healthy | RolloutPhase::RolledBack | RolloutPhase::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    CronJob,
    Job,
    DaemonSet,
}

impl WorkloadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::CronJob => "CronJob",
            WorkloadKind::Job => "Job",
            WorkloadKind::DaemonSet => "DaemonSet",
        }
    }

    /// Whether the kind rolls pods gradually and reports replica counts
    pub fn has_rolling_update(self) -> bool {
        matches!(self, WorkloadKind::Deployment)
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the workload a rollout targets, captured when the rollout starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(kind: WorkloadKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// What produced the artifact being rolled out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RolloutOrigin {
    #[serde(rename_all = "camelCase")]
    Learning {
        task: String,
        trigger: TriggerKind,
        confidence: f64,
    },
    #[serde(rename_all = "camelCase")]
    SelfHealing { attempt: i32 },
}

impl RolloutOrigin {
    fn describe(&self) -> String {
        match self {
            RolloutOrigin::Learning { task, .. } => format!("learned task {task}"),
            RolloutOrigin::SelfHealing { attempt } => {
                format!("self-healed code (attempt {attempt})")
            }
        }
    }
}

/// Rollout state persisted between reconciles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRollout {
    pub phase: RolloutPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<WorkloadRef>,
    pub target_artifact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_artifact: Option<String>,
    pub version: u32,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub origin: RolloutOrigin,
}

/// Drives [`PendingRollout`]s against the cluster
pub struct RolloutController {
    client: Client,
    namespace: String,
    events: Arc<dyn EventPublisher>,
}

impl RolloutController {
    #[must_use]
    pub fn new(
        client: Client,
        namespace: &str,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            events,
        }
    }

    /// Advance `pending` by one step.
    ///
    /// On `Ok` the phase is either still in flight (`Patching`/`Waiting`) or
    /// `Healthy`. Terminal failures set the phase and return the error.
    #[instrument(skip(self, agent, pending), fields(agent = %agent.name_any(), target = %pending.target_artifact, phase = ?pending.phase))]
    pub async fn advance(
        &self,
        agent: &LanguageAgent,
        pending: &mut PendingRollout,
        now: DateTime<Utc>,
    ) -> Result<(), RolloutError> {
        match pending.phase {
            RolloutPhase::Patching => self.patch(agent, pending, now).await,
            RolloutPhase::Waiting => self.wait(agent, pending, now).await,
            RolloutPhase::Healthy | RolloutPhase::RolledBack | RolloutPhase::Failed => Ok(()),
        }
    }

    async fn patch(
        &self,
        agent: &LanguageAgent,
        pending: &mut PendingRollout,
        now: DateTime<Utc>,
    ) -> Result<(), RolloutError> {
        let agent_name = agent.name_any();

        if now >= pending.deadline {
            pending.phase = RolloutPhase::Failed;
            return Err(RolloutError::DeadlineExceeded {
                target: pending.target_artifact.clone(),
            });
        }

        let workload = match &pending.workload {
            Some(w) => w.clone(),
            None => {
                match locate_workload(self.client.clone(), &self.namespace, &agent_name).await? {
                    Some(w) => {
                        pending.workload = Some(w.clone());
                        w
                    }
                    None => {
                        info!(agent = %agent_name, "No workload found for agent, nothing to roll out");
                        pending.phase = RolloutPhase::Healthy;
                        return Ok(());
                    }
                }
            }
        };

        let original = update_workload(
            self.client.clone(),
            &self.namespace,
            &workload,
            &agent_name,
            TemplateUpdate::Apply(&pending.target_artifact),
            now,
        )
        .await?;

        if pending.original_artifact.is_none() {
            pending.original_artifact = Some(original);
        }

        info!(
            agent = %agent_name,
            workload = %workload,
            target = %pending.target_artifact,
            original = ?pending.original_artifact,
            "Patched workload to new artifact"
        );

        if workload.kind.has_rolling_update() {
            pending.phase = RolloutPhase::Waiting;
        } else {
            pending.phase = RolloutPhase::Healthy;
            self.events
                .publish(
                    agent,
                    AuditEvent::normal(
                        &format!("Learning{}Updated", workload.kind),
                        format!(
                            "Updated {} to use {} (v{})",
                            workload.kind,
                            pending.origin.describe(),
                            pending.version
                        ),
                    ),
                )
                .await;
        }
        Ok(())
    }

    async fn wait(
        &self,
        agent: &LanguageAgent,
        pending: &mut PendingRollout,
        now: DateTime<Utc>,
    ) -> Result<(), RolloutError> {
        let Some(workload) = pending.workload.clone() else {
            // Waiting without a workload cannot progress
            pending.phase = RolloutPhase::Failed;
            return Err(RolloutError::MissingPodTemplate {
                workload: pending.target_artifact.clone(),
            });
        };

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let deployment = match deployments.get(&workload.name).await {
            Ok(deployment) => deployment,
            Err(kube::Error::Api(err)) if err.code == 404 => {
                error!(workload = %workload, "Deployment disappeared while waiting for rollout");
                pending.phase = RolloutPhase::Failed;
                return Err(RolloutError::WorkloadGone {
                    workload: workload.to_string(),
                });
            }
            Err(e) if now >= pending.deadline => {
                warn!(workload = %workload, error = %e, "Cannot read deployment after rollout deadline");
                return self.rollback(agent, pending, &workload, now).await;
            }
            Err(e) => return Err(e.into()),
        };

        let counts = match ReplicaCounts::from_deployment(&deployment) {
            Ok(counts) => Some(counts),
            Err(e) => {
                warn!(workload = %workload, error = %e, "Cannot decode deployment status");
                None
            }
        };

        match evaluate_wait(counts.as_ref(), now, pending.deadline) {
            WaitOutcome::Pending => {
                debug!(workload = %workload, ?counts, "Waiting for deployment rollout");
                Ok(())
            }
            WaitOutcome::Converged => {
                let Some(counts) = counts else {
                    return Ok(());
                };
                self.verify_health(agent, pending, &workload, &counts).await
            }
            WaitOutcome::TimedOut => self.rollback(agent, pending, &workload, now).await,
        }
    }

    async fn verify_health(
        &self,
        agent: &LanguageAgent,
        pending: &mut PendingRollout,
        workload: &WorkloadRef,
        counts: &ReplicaCounts,
    ) -> Result<(), RolloutError> {
        if let Err(reason) = counts.healthy() {
            error!(workload = %workload, %reason, "Deployment health check failed after update");
            pending.phase = RolloutPhase::Failed;
            self.events
                .publish(
                    agent,
                    AuditEvent::warning(
                        "LearningHealthCheck",
                        format!(
                            "Deployment health check failed after update to {}",
                            pending.origin.describe()
                        ),
                    ),
                )
                .await;
            return Err(RolloutError::Unhealthy {
                workload: workload.to_string(),
                reason,
            });
        }

        pending.phase = RolloutPhase::Healthy;
        info!(workload = %workload, version = pending.version, "Deployment rollout completed");
        self.events
            .publish(
                agent,
                AuditEvent::normal(
                    "LearningDeploymentUpdated",
                    format!(
                        "Updated deployment to use {} (v{})",
                        pending.origin.describe(),
                        pending.version
                    ),
                ),
            )
            .await;
        Ok(())
    }

    async fn rollback(
        &self,
        agent: &LanguageAgent,
        pending: &mut PendingRollout,
        workload: &WorkloadRef,
        now: DateTime<Utc>,
    ) -> Result<(), RolloutError> {
        let agent_name = agent.name_any();
        let original = pending
            .original_artifact
            .clone()
            .unwrap_or_else(|| artifact_name(&agent_name, 1));

        error!(workload = %workload, original = %original, "Deployment rollout timed out, rolling back");

        match update_workload(
            self.client.clone(),
            &self.namespace,
            workload,
            &agent_name,
            TemplateUpdate::Restore(&original),
            now,
        )
        .await
        {
            Ok(_) => {
                pending.phase = RolloutPhase::RolledBack;
                self.events
                    .publish(
                        agent,
                        AuditEvent::warning(
                            "LearningRollback",
                            format!(
                                "Rolled back deployment after failed update to {}",
                                pending.origin.describe()
                            ),
                        ),
                    )
                    .await;
                Err(RolloutError::RolledBack {
                    workload: workload.to_string(),
                })
            }
            Err(e) => {
                error!(workload = %workload, error = %e, "Failed to roll back deployment");
                pending.phase = RolloutPhase::Failed;
                Err(RolloutError::RollbackFailed {
                    workload: workload.to_string(),
                    source: Box::new(e),
                })
            }
        }
    }
}

/// A rollout in `Patching` whose deadline is `timeout` from `now`
pub fn new_pending_rollout(
    target_artifact: String,
    version: u32,
    origin: RolloutOrigin,
    now: DateTime<Utc>,
    timeout: std::time::Duration,
) -> PendingRollout {
    let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::minutes(5));
    PendingRollout {
        phase: RolloutPhase::Patching,
        workload: None,
        target_artifact,
        original_artifact: None,
        version,
        started_at: now,
        deadline: now + timeout,
        origin,
    }
}
