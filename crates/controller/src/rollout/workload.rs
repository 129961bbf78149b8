//! Agent workloads whose pod templates reference code artifacts

use super::references::{original_artifact_ref, rewrite_artifact_refs};
use super::{RolloutError, WorkloadKind, WorkloadRef};
use crate::tasks::types::{AGENT_LABEL, LEARNED_CONFIGMAP_ANNOTATION, LEARNING_UPDATE_ANNOTATION};
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, ObjectMeta, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::{debug, info, warn};

/// Annotation recording the artifact a workload pointed at before a rollout
pub const ROLLBACK_CONFIGMAP_ANNOTATION: &str = "langop.io/rollback-configmap";

/// A workload kind with a pod template
pub trait AgentWorkload:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    const KIND: WorkloadKind;

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec>;
}

impl AgentWorkload for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }
}

impl AgentWorkload for CronJob {
    const KIND: WorkloadKind = WorkloadKind::CronJob;

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec
            .as_mut()
            .and_then(|s| s.job_template.spec.as_mut())
            .map(|s| &mut s.template)
    }
}

impl AgentWorkload for Job {
    const KIND: WorkloadKind = WorkloadKind::Job;

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }
}

impl AgentWorkload for DaemonSet {
    const KIND: WorkloadKind = WorkloadKind::DaemonSet;

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }
}

/// Outcome of [`retarget_template`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retarget {
    /// Artifact to restore on rollback
    pub original: String,
    /// Whether the template was modified and needs to be written back
    pub changed: bool,
}

/// Point a pod template at `target` and stamp the update annotations.
///
/// When the template was already moved to `target` (a rollout resumed after a
/// crash) nothing is modified and the recorded rollback annotation supplies
/// the original.
pub fn retarget_template(
    template: &mut PodTemplateSpec,
    agent_name: &str,
    target: &str,
    now: DateTime<Utc>,
) -> Option<Retarget> {
    let spec = template.spec.as_mut()?;
    let annotations = template
        .metadata
        .get_or_insert_with(ObjectMeta::default)
        .annotations
        .get_or_insert_with(BTreeMap::new);

    let current = original_artifact_ref(spec, agent_name);
    let rewritten = rewrite_artifact_refs(spec, agent_name, target);
    let original = if current == target {
        annotations
            .get(ROLLBACK_CONFIGMAP_ANNOTATION)
            .cloned()
            .unwrap_or(current)
    } else {
        current
    };

    if !rewritten && annotations.get(LEARNED_CONFIGMAP_ANNOTATION).map(String::as_str) == Some(target) {
        return Some(Retarget {
            original,
            changed: false,
        });
    }

    annotations.insert(
        LEARNING_UPDATE_ANNOTATION.to_string(),
        now.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    annotations.insert(LEARNED_CONFIGMAP_ANNOTATION.to_string(), target.to_string());
    annotations.insert(ROLLBACK_CONFIGMAP_ANNOTATION.to_string(), original.clone());

    Some(Retarget {
        original,
        changed: true,
    })
}

/// Point a pod template back at `original` and clear the rollback marker
pub fn restore_template(
    template: &mut PodTemplateSpec,
    agent_name: &str,
    original: &str,
    now: DateTime<Utc>,
) -> bool {
    let Some(spec) = template.spec.as_mut() else {
        return false;
    };
    rewrite_artifact_refs(spec, agent_name, original);

    let annotations = template
        .metadata
        .get_or_insert_with(ObjectMeta::default)
        .annotations
        .get_or_insert_with(BTreeMap::new);
    annotations.insert(
        LEARNING_UPDATE_ANNOTATION.to_string(),
        now.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    annotations.insert(
        LEARNED_CONFIGMAP_ANNOTATION.to_string(),
        original.to_string(),
    );
    annotations.remove(ROLLBACK_CONFIGMAP_ANNOTATION);
    true
}

/// First workload of kind `K` labelled with the agent's name
async fn find_labelled<K: AgentWorkload>(
    client: Client,
    namespace: &str,
    agent_name: &str,
) -> Result<Option<K>, kube::Error> {
    let api: Api<K> = Api::namespaced(client, namespace);
    let selector = format!("{AGENT_LABEL}={agent_name}");
    let list = api.list(&ListParams::default().labels(&selector)).await?;

    if list.items.len() > 1 {
        info!(
            agent = %agent_name,
            kind = %K::KIND,
            count = list.items.len(),
            "Multiple workloads found for agent, using first one"
        );
    }
    Ok(list.items.into_iter().next())
}

/// Locate the agent's workload, trying Deployment, CronJob, Job and DaemonSet
pub async fn locate_workload(
    client: Client,
    namespace: &str,
    agent_name: &str,
) -> Result<Option<WorkloadRef>, kube::Error> {
    if let Some(d) = find_labelled::<Deployment>(client.clone(), namespace, agent_name).await? {
        return Ok(Some(WorkloadRef::new(WorkloadKind::Deployment, d.name_any())));
    }
    debug!(agent = %agent_name, "No deployment found, checking other workload kinds");

    if let Some(c) = find_labelled::<CronJob>(client.clone(), namespace, agent_name).await? {
        return Ok(Some(WorkloadRef::new(WorkloadKind::CronJob, c.name_any())));
    }
    if let Some(j) = find_labelled::<Job>(client.clone(), namespace, agent_name).await? {
        return Ok(Some(WorkloadRef::new(WorkloadKind::Job, j.name_any())));
    }
    if let Some(ds) = find_labelled::<DaemonSet>(client, namespace, agent_name).await? {
        return Ok(Some(WorkloadRef::new(WorkloadKind::DaemonSet, ds.name_any())));
    }
    Ok(None)
}

/// Direction of a template update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateUpdate<'a> {
    /// Roll forward to the artifact
    Apply(&'a str),
    /// Roll back to the artifact
    Restore(&'a str),
}

/// Read, update and replace the workload. Returns the rollback target for
/// [`TemplateUpdate::Apply`] and the restored artifact for
/// [`TemplateUpdate::Restore`].
pub async fn update_workload(
    client: Client,
    namespace: &str,
    workload: &WorkloadRef,
    agent_name: &str,
    update: TemplateUpdate<'_>,
    now: DateTime<Utc>,
) -> Result<String, RolloutError> {
    match workload.kind {
        WorkloadKind::Deployment => {
            update_typed::<Deployment>(client, namespace, &workload.name, agent_name, update, now)
                .await
        }
        WorkloadKind::CronJob => {
            update_typed::<CronJob>(client, namespace, &workload.name, agent_name, update, now)
                .await
        }
        WorkloadKind::Job => {
            update_typed::<Job>(client, namespace, &workload.name, agent_name, update, now).await
        }
        WorkloadKind::DaemonSet => {
            update_typed::<DaemonSet>(client, namespace, &workload.name, agent_name, update, now)
                .await
        }
    }
}

async fn update_typed<K: AgentWorkload>(
    client: Client,
    namespace: &str,
    name: &str,
    agent_name: &str,
    update: TemplateUpdate<'_>,
    now: DateTime<Utc>,
) -> Result<String, RolloutError> {
    let api: Api<K> = Api::namespaced(client, namespace);
    let mut object = api.get(name).await?;

    let missing = || RolloutError::MissingPodTemplate {
        workload: format!("{}/{}", K::KIND, name),
    };
    let template = object.pod_template_mut().ok_or_else(missing)?;

    let result = match update {
        TemplateUpdate::Apply(target) => {
            let retarget = retarget_template(template, agent_name, target, now).ok_or_else(missing)?;
            if !retarget.changed {
                debug!(kind = %K::KIND, workload = %name, target, "Workload already references artifact");
                return Ok(retarget.original);
            }
            retarget.original
        }
        TemplateUpdate::Restore(original) => {
            if !restore_template(template, agent_name, original, now) {
                return Err(missing());
            }
            original.to_string()
        }
    };

    api.replace(name, &PostParams::default(), &object)
        .await
        .map_err(|e| {
            warn!(kind = %K::KIND, workload = %name, error = %e, "Failed to update workload");
            RolloutError::from(e)
        })?;

    debug!(kind = %K::KIND, workload = %name, ?update, "Updated workload pod template");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::api::core::v1::{ConfigMapVolumeSource, PodSpec, Volume};

    fn template(cm: &str) -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: Some(ObjectMeta::default()),
            spec: Some(PodSpec {
                volumes: Some(vec![Volume {
                    name: "code".to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: cm.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    fn volume_cm(t: &PodTemplateSpec) -> String {
        t.spec.as_ref().unwrap().volumes.as_ref().unwrap()[0]
            .config_map
            .as_ref()
            .unwrap()
            .name
            .clone()
    }

    fn annotation(t: &PodTemplateSpec, key: &str) -> Option<String> {
        t.metadata
            .as_ref()
            .and_then(|m| m.annotations.as_ref())
            .and_then(|a| a.get(key).cloned())
    }

    #[test]
    fn retarget_stamps_annotations_and_returns_original() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let mut t = template("bot-v2");

        let retarget = retarget_template(&mut t, "bot", "bot-v3", now).unwrap();
        assert_eq!(retarget.original, "bot-v2");
        assert!(retarget.changed);
        assert_eq!(volume_cm(&t), "bot-v3");
        assert_eq!(
            annotation(&t, LEARNING_UPDATE_ANNOTATION).as_deref(),
            Some("2025-01-01T12:00:00Z")
        );
        assert_eq!(annotation(&t, LEARNED_CONFIGMAP_ANNOTATION).as_deref(), Some("bot-v3"));
        assert_eq!(annotation(&t, ROLLBACK_CONFIGMAP_ANNOTATION).as_deref(), Some("bot-v2"));
    }

    #[test]
    fn resumed_retarget_is_a_no_op_that_keeps_recorded_original() {
        let first = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let mut t = template("bot-v2");
        retarget_template(&mut t, "bot", "bot-v3", first).unwrap();
        let applied = t.clone();

        // second pass after a restart sees bot-v3 already in place
        let later = first + chrono::Duration::minutes(2);
        let retarget = retarget_template(&mut t, "bot", "bot-v3", later).unwrap();
        assert_eq!(retarget.original, "bot-v2");
        assert!(!retarget.changed);
        assert_eq!(t, applied);
        assert_eq!(
            annotation(&t, LEARNING_UPDATE_ANNOTATION).as_deref(),
            Some("2025-01-01T12:00:00Z")
        );
    }

    #[test]
    fn restore_returns_to_exact_original() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let mut t = template("bot-v7");
        let retarget = retarget_template(&mut t, "bot", "bot-v8", now).unwrap();

        assert!(restore_template(&mut t, "bot", &retarget.original, now));
        assert_eq!(volume_cm(&t), "bot-v7");
        assert!(annotation(&t, ROLLBACK_CONFIGMAP_ANNOTATION).is_none());
    }

    #[test]
    fn template_without_pod_spec_is_rejected() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let mut t = PodTemplateSpec::default();
        assert!(retarget_template(&mut t, "bot", "bot-v2", now).is_none());
        assert!(!restore_template(&mut t, "bot", "bot-v1", now));
    }
}
