//! Durable per-task learning state
//!
//! Each agent owns one `ConfigMap` named `{agent}-learning-status`. Every task is
//! stored as a versioned JSON record under `{task}-status`; an in-flight rollout,
//! if any, is stored under `rollout`.

use crate::crds::LanguageAgent;
use crate::rollout::PendingRollout;
use crate::tasks::types::{Error, Result, AGENT_LABEL, COMPONENT_LABEL};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Current encoding version of task records
pub const STATUS_SCHEMA_VERSION: u32 = 1;

const STATUS_KEY_SUFFIX: &str = "-status";
const ROLLOUT_KEY: &str = "rollout";
const LEARNING_STATUS_COMPONENT: &str = "learning-status";

/// Learning state of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLearningStatus {
    pub schema_version: u32,
    pub task_name: String,
    #[serde(default)]
    pub trace_count: u32,
    #[serde(default)]
    pub learning_attempts: u32,
    /// Starts at 1, increases by exactly one per committed learning
    pub current_version: u32,
    /// Artifact version the task was last rolled out with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_version: Option<u32>,
    #[serde(default)]
    pub is_symbolic: bool,
    #[serde(default)]
    pub pattern_confidence: f64,
    #[serde(default)]
    pub error_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_pattern: Option<String>,
    #[serde(default)]
    pub unique_pattern_count: usize,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub error_resynthesis_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_learning_attempt: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_pattern: Option<String>,
}

impl TaskLearningStatus {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            schema_version: STATUS_SCHEMA_VERSION,
            task_name: task_name.into(),
            trace_count: 0,
            learning_attempts: 0,
            current_version: 1,
            artifact_version: None,
            is_symbolic: false,
            pattern_confidence: 0.0,
            error_rate: 0.0,
            common_pattern: None,
            unique_pattern_count: 0,
            consecutive_failures: 0,
            error_resynthesis_attempts: 0,
            last_learning_attempt: None,
            last_success_time: None,
            last_failure_time: None,
            last_error_message: None,
            failure_pattern: None,
        }
    }

    /// Whether `interval` has not yet passed since the last learning attempt
    pub fn in_cooldown(&self, interval: std::time::Duration, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_learning_attempt else {
            return false;
        };
        let interval = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(last) < interval
    }
}

/// A task entry or rollout entry that could not be decoded
#[derive(Debug, Error)]
pub enum StatusDecodeError {
    #[error("entry '{key}' has unsupported schema version {found}")]
    UnsupportedSchema { key: String, found: u64 },

    #[error("entry '{key}' is not valid JSON: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StatusDecodeError {
    pub fn key(&self) -> &str {
        match self {
            StatusDecodeError::UnsupportedSchema { key, .. }
            | StatusDecodeError::Malformed { key, .. } => key,
        }
    }
}

impl From<StatusDecodeError> for Error {
    fn from(err: StatusDecodeError) -> Self {
        Error::StatusDecode {
            task: err.key().trim_end_matches(STATUS_KEY_SUFFIX).to_string(),
            reason: err.to_string(),
        }
    }
}

/// All learning state of one agent.
///
/// Task entries live in a flat arena addressed through a name index, so callers
/// mutate through [`LearningRecord::get_or_insert`] and [`LearningRecord::update`]
/// instead of holding references into a map they are iterating.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LearningRecord {
    tasks: Vec<TaskLearningStatus>,
    index: BTreeMap<String, usize>,
    pub pending_rollout: Option<PendingRollout>,
}

impl LearningRecord {
    pub fn get(&self, task_name: &str) -> Option<&TaskLearningStatus> {
        self.index.get(task_name).map(|&i| &self.tasks[i])
    }

    /// Existing entry for `task_name`, or a fresh one at version 1
    pub fn get_or_insert(&mut self, task_name: &str) -> &mut TaskLearningStatus {
        let i = match self.index.get(task_name) {
            Some(&i) => i,
            None => {
                self.tasks.push(TaskLearningStatus::new(task_name));
                let i = self.tasks.len() - 1;
                self.index.insert(task_name.to_string(), i);
                i
            }
        };
        &mut self.tasks[i]
    }

    /// Apply `f` to an existing entry; `false` when the task is unknown
    pub fn update<F>(&mut self, task_name: &str, f: F) -> bool
    where
        F: FnOnce(&mut TaskLearningStatus),
    {
        match self.index.get(task_name) {
            Some(&i) => {
                f(&mut self.tasks[i]);
                true
            }
            None => false,
        }
    }

    /// Insert or replace an entry
    pub fn upsert(&mut self, status: TaskLearningStatus) {
        match self.index.get(&status.task_name) {
            Some(&i) => self.tasks[i] = status,
            None => {
                self.index.insert(status.task_name.clone(), self.tasks.len());
                self.tasks.push(status);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskLearningStatus> {
        self.tasks.iter()
    }

    pub fn task_names(&self) -> Vec<String> {
        self.index.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Decode `ConfigMap` data. Undecodable entries are returned as errors and
    /// left out of the record.
    pub fn from_data(data: &BTreeMap<String, String>) -> (Self, Vec<StatusDecodeError>) {
        let mut record = Self::default();
        let mut errors = Vec::new();

        for (key, raw) in data {
            if key == ROLLOUT_KEY {
                match serde_json::from_str::<PendingRollout>(raw) {
                    Ok(pending) => record.pending_rollout = Some(pending),
                    Err(source) => errors.push(StatusDecodeError::Malformed {
                        key: key.clone(),
                        source,
                    }),
                }
                continue;
            }
            if !key.ends_with(STATUS_KEY_SUFFIX) {
                continue;
            }
            match decode_task_status(key, raw) {
                Ok(status) => record.upsert(status),
                Err(err) => errors.push(err),
            }
        }

        (record, errors)
    }

    /// Encode as `ConfigMap` data
    pub fn to_data(&self) -> Result<BTreeMap<String, String>, serde_json::Error> {
        let mut data = BTreeMap::new();
        for status in &self.tasks {
            data.insert(status_key(&status.task_name), serde_json::to_string(status)?);
        }
        if let Some(pending) = &self.pending_rollout {
            data.insert(ROLLOUT_KEY.to_string(), serde_json::to_string(pending)?);
        }
        Ok(data)
    }
}

fn decode_task_status(key: &str, raw: &str) -> Result<TaskLearningStatus, StatusDecodeError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|source| StatusDecodeError::Malformed {
            key: key.to_string(),
            source,
        })?;

    let found = value
        .get("schemaVersion")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    if found != u64::from(STATUS_SCHEMA_VERSION) {
        return Err(StatusDecodeError::UnsupportedSchema {
            key: key.to_string(),
            found,
        });
    }

    serde_json::from_value(value).map_err(|source| StatusDecodeError::Malformed {
        key: key.to_string(),
        source,
    })
}

/// `ConfigMap` key for a task. Characters outside the key alphabet become `_`.
pub fn status_key(task_name: &str) -> String {
    let safe: String = task_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}{STATUS_KEY_SUFFIX}")
}

/// `ConfigMap`-backed persistence for [`LearningRecord`]s
pub struct LearningStatusStore {
    configmaps: Api<ConfigMap>,
    namespace: String,
}

impl LearningStatusStore {
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            configmaps: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    pub fn configmap_name(agent_name: &str) -> String {
        format!("{agent_name}-learning-status")
    }

    /// Load the agent's record; a missing `ConfigMap` yields an empty record
    pub async fn load(&self, agent: &LanguageAgent) -> Result<LearningRecord> {
        let cm_name = Self::configmap_name(&agent.name_any());

        match self.configmaps.get(&cm_name).await {
            Ok(cm) => {
                let data = cm.data.unwrap_or_default();
                let (record, errors) = LearningRecord::from_data(&data);
                for err in errors {
                    let err = Error::from(err);
                    warn!(configmap = %cm_name, error = %err, "Reinitialising undecodable learning status entry");
                }
                debug!(configmap = %cm_name, tasks = record.len(), "Loaded learning status");
                Ok(record)
            }
            Err(kube::Error::Api(err)) if err.code == 404 => {
                debug!(configmap = %cm_name, "No learning status yet");
                Ok(LearningRecord::default())
            }
            Err(e) => {
                error!("Failed to load learning status {}: {}", cm_name, e);
                Err(e.into())
            }
        }
    }

    /// Persist the agent's record, creating the `ConfigMap` on first use
    pub async fn save(&self, agent: &LanguageAgent, record: &LearningRecord) -> Result<()> {
        let agent_name = agent.name_any();
        let cm_name = Self::configmap_name(&agent_name);
        let data = record.to_data()?;

        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(cm_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([
                    (AGENT_LABEL.to_string(), agent_name.clone()),
                    (
                        COMPONENT_LABEL.to_string(),
                        LEARNING_STATUS_COMPONENT.to_string(),
                    ),
                ])),
                owner_references: agent.controller_owner_ref(&()).map(|r| vec![r]),
                ..Default::default()
            },
            data: Some(data.clone()),
            ..Default::default()
        };

        match self.configmaps.create(&PostParams::default(), &cm).await {
            Ok(_) => {
                debug!(configmap = %cm_name, "Created learning status");
            }
            Err(kube::Error::Api(err)) if err.code == 409 => {
                let mut patch_data: serde_json::Map<String, serde_json::Value> = data
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect();
                if record.pending_rollout.is_none() {
                    // merge-patch null removes a finished rollout
                    patch_data.insert(ROLLOUT_KEY.to_string(), serde_json::Value::Null);
                }
                let patch = serde_json::json!({ "data": patch_data });

                self.configmaps
                    .patch(&cm_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                debug!(configmap = %cm_name, "Updated learning status");
            }
            Err(e) => {
                error!("Failed to save learning status {}: {}", cm_name, e);
                return Err(e.into());
            }
        }

        Ok(())
    }
}
