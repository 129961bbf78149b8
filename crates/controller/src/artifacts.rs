//! Versioned code artifacts
//!
//! Every generated code version lives in its own immutable `ConfigMap`
//! `{agent}-v{N}` owned by the agent. Version 1 is the initial synthesis and is
//! created outside this controller; learning and self-healing publish v2 onward.

use crate::crds::LanguageAgent;
use crate::rollout::artifact_name;
use crate::tasks::types::{Error, Result, AGENT_LABEL, COMPONENT_LABEL};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{error, info, warn};

pub const VERSION_LABEL: &str = "langop.io/version";
pub const SYNTHESIS_TYPE_LABEL: &str = "langop.io/synthesis-type";
pub const LEARNED_TASK_LABEL: &str = "langop.io/learned-task";
pub const PREVIOUS_VERSION_LABEL: &str = "langop.io/previous-version";
pub const CREATED_AT_ANNOTATION: &str = "langop.io/created-at";
pub const LEARNED_FROM_ANNOTATION: &str = "langop.io/learned-from";
pub const CODE_HASH_ANNOTATION: &str = "langop.io/code-hash";

/// Data key holding the agent code
pub const CODE_KEY: &str = "agent.rb";

const AGENT_CODE_COMPONENT: &str = "agent-code";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisType {
    Initial,
    Learned,
    Healed,
}

impl SynthesisType {
    pub fn as_str(self) -> &'static str {
        match self {
            SynthesisType::Initial => "initial",
            SynthesisType::Learned => "learned",
            SynthesisType::Healed => "healed",
        }
    }
}

/// Parameters for a new artifact version
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactOptions {
    pub code: String,
    pub version: u32,
    pub synthesis_type: SynthesisType,
    pub previous_version: Option<u32>,
    pub learned_task: Option<String>,
    /// Where the code came from, e.g. `pattern-detection` or `error-recovery`
    pub learning_source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Versions to keep, newest first; 0 keeps everything
    pub keep_last_n: usize,
    pub always_keep_initial: bool,
    /// Age limit in days; 0 disables age-based deletion
    pub cleanup_after_days: u32,
}

/// Metadata of a stored artifact
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactVersion {
    pub name: String,
    pub version: u32,
    pub synthesis_type: Option<String>,
    pub learned_task: Option<String>,
    pub previous_version: Option<u32>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Storage for versioned agent code
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Next unused version number for the agent (at least 2)
    async fn next_version(&self, agent: &LanguageAgent) -> Result<u32>;

    /// Publish a new version, returning the artifact name
    async fn create_versioned_artifact(
        &self,
        agent: &LanguageAgent,
        options: ArtifactOptions,
    ) -> Result<String>;

    /// Delete versions outside the policy, returning how many were removed
    async fn apply_retention_policy(
        &self,
        agent: &LanguageAgent,
        policy: RetentionPolicy,
    ) -> Result<usize>;
}

/// Hex SHA-256 of generated code
pub fn code_hash(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

/// Artifacts to delete under `policy`, given versions in any order
pub fn select_for_deletion<'a>(
    versions: &'a [ArtifactVersion],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<&'a ArtifactVersion> {
    let mut sorted: Vec<&ArtifactVersion> = versions.iter().collect();
    sorted.sort_by(|a, b| b.version.cmp(&a.version));

    sorted
        .into_iter()
        .enumerate()
        .filter(|(_, v)| !(policy.always_keep_initial && v.version == 1))
        .filter(|(index, v)| {
            let beyond_count = policy.keep_last_n > 0 && *index >= policy.keep_last_n;
            let too_old = policy.cleanup_after_days > 0
                && v.created_at.is_some_and(|created| {
                    (now - created).num_days() > i64::from(policy.cleanup_after_days)
                });
            beyond_count || too_old
        })
        .map(|(_, v)| v)
        .collect()
}

/// Read artifact metadata from a `ConfigMap`. Objects without a numeric version label are skipped.
pub fn parse_artifact_version(cm: &ConfigMap) -> Option<ArtifactVersion> {
    let labels = cm.metadata.labels.as_ref()?;
    let version = labels.get(VERSION_LABEL)?.parse().ok()?;
    let annotations = cm.metadata.annotations.as_ref();

    let created_at = annotations
        .and_then(|a| a.get(CREATED_AT_ANNOTATION))
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .or_else(|| cm.metadata.creation_timestamp.as_ref().map(|t| t.0));

    Some(ArtifactVersion {
        name: cm.name_any(),
        version,
        synthesis_type: labels.get(SYNTHESIS_TYPE_LABEL).cloned(),
        learned_task: labels.get(LEARNED_TASK_LABEL).cloned(),
        previous_version: labels
            .get(PREVIOUS_VERSION_LABEL)
            .and_then(|v| v.parse().ok()),
        created_at,
    })
}

/// Build the `ConfigMap` for a new artifact
pub fn build_artifact(
    agent: &LanguageAgent,
    namespace: &str,
    options: &ArtifactOptions,
    now: DateTime<Utc>,
) -> ConfigMap {
    let agent_name = agent.name_any();

    let mut labels = BTreeMap::from([
        (AGENT_LABEL.to_string(), agent_name.clone()),
        (VERSION_LABEL.to_string(), options.version.to_string()),
        (
            SYNTHESIS_TYPE_LABEL.to_string(),
            options.synthesis_type.as_str().to_string(),
        ),
        (
            COMPONENT_LABEL.to_string(),
            AGENT_CODE_COMPONENT.to_string(),
        ),
    ]);
    if let Some(task) = options.learned_task.as_deref().filter(|t| !t.is_empty()) {
        labels.insert(LEARNED_TASK_LABEL.to_string(), sanitize_label_value(task));
    }
    if let Some(previous) = options.previous_version.filter(|v| *v > 0) {
        labels.insert(PREVIOUS_VERSION_LABEL.to_string(), previous.to_string());
    }

    let annotations = BTreeMap::from([
        (CREATED_AT_ANNOTATION.to_string(), now.to_rfc3339()),
        (
            LEARNED_FROM_ANNOTATION.to_string(),
            options.learning_source.clone(),
        ),
        (CODE_HASH_ANNOTATION.to_string(), code_hash(&options.code)),
    ]);

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(artifact_name(&agent_name, options.version)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: agent.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            CODE_KEY.to_string(),
            options.code.clone(),
        )])),
        ..Default::default()
    }
}

/// Label values are limited to 63 alphanumerics, `-`, `_` and `.`
fn sanitize_label_value(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(63)
        .collect();
    cleaned
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// [`ArtifactStore`] backed by `ConfigMap`s in the controller namespace
pub struct ConfigMapArtifactStore {
    configmaps: Api<ConfigMap>,
    namespace: String,
}

impl ConfigMapArtifactStore {
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            configmaps: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    async fn list_versions(&self, agent_name: &str) -> Result<Vec<ArtifactVersion>> {
        let selector = format!("{AGENT_LABEL}={agent_name},{COMPONENT_LABEL}={AGENT_CODE_COMPONENT}");
        let list = self
            .configmaps
            .list(&ListParams::default().labels(&selector))
            .await?;

        Ok(list
            .items
            .iter()
            .filter_map(|cm| {
                let parsed = parse_artifact_version(cm);
                if parsed.is_none() {
                    warn!(configmap = %cm.name_any(), "Skipping artifact without a valid version label");
                }
                parsed
            })
            .collect())
    }
}

#[async_trait]
impl ArtifactStore for ConfigMapArtifactStore {
    async fn next_version(&self, agent: &LanguageAgent) -> Result<u32> {
        let versions = self.list_versions(&agent.name_any()).await?;
        let latest = versions.iter().map(|v| v.version).max().unwrap_or(1).max(1);
        Ok(latest + 1)
    }

    async fn create_versioned_artifact(
        &self,
        agent: &LanguageAgent,
        options: ArtifactOptions,
    ) -> Result<String> {
        if options.version == 0 {
            return Err(Error::Artifact("version must be positive".to_string()));
        }

        let cm = build_artifact(agent, &self.namespace, &options, Utc::now());
        let name = cm.name_any();

        self.configmaps
            .create(&PostParams::default(), &cm)
            .await
            .map_err(|e| Error::Artifact(format!("failed to create artifact {name}: {e}")))?;

        info!(
            configmap = %name,
            version = options.version,
            synthesis_type = options.synthesis_type.as_str(),
            learned_task = options.learned_task.as_deref().unwrap_or(""),
            "Created versioned artifact"
        );
        Ok(name)
    }

    async fn apply_retention_policy(
        &self,
        agent: &LanguageAgent,
        policy: RetentionPolicy,
    ) -> Result<usize> {
        let agent_name = agent.name_any();
        let versions = self.list_versions(&agent_name).await?;
        let doomed = select_for_deletion(&versions, &policy, Utc::now());

        let mut deleted = 0;
        for version in &doomed {
            match self
                .configmaps
                .delete(&version.name, &DeleteParams::default())
                .await
            {
                Ok(_) => deleted += 1,
                Err(kube::Error::Api(err)) if err.code == 404 => deleted += 1,
                Err(e) => {
                    error!(
                        configmap = %version.name,
                        version = version.version,
                        "Failed to delete artifact during retention cleanup: {}",
                        e
                    );
                }
            }
        }

        if deleted > 0 {
            info!(
                agent = %agent_name,
                total_versions = versions.len(),
                deleted_versions = deleted,
                "Applied artifact retention policy"
            );
        }
        Ok(deleted)
    }
}
