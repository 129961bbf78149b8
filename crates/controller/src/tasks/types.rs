use crate::artifacts::ArtifactStore;
use crate::events::EventPublisher;
use crate::metrics::LearningMetrics;
use crate::rollout::RolloutError;
use crate::synthesis::{SynthesisError, Synthesizer};
use crate::tasks::config::ControllerConfig;
use crate::telemetry::{TelemetryError, TraceAdapter};
use kube::Client;
use std::sync::Arc;
use thiserror::Error;

/// Label carrying the owning agent's name on every managed object
pub const AGENT_LABEL: &str = "langop.io/agent";

/// Label distinguishing the role of a managed `ConfigMap`
pub const COMPONENT_LABEL: &str = "langop.io/component";

/// Annotation that disables learning for a single agent
pub const LEARNING_DISABLED_ANNOTATION: &str = "langop.io/learning-disabled";

/// Annotation stamped on pod templates to force a rolling update
pub const LEARNING_UPDATE_ANNOTATION: &str = "langop.io/learning-update";

/// Annotation naming the artifact a workload was last pointed at
pub const LEARNED_CONFIGMAP_ANNOTATION: &str = "langop.io/learned-configmap";

/// Name of the agent container inside the workload pod
pub const AGENT_CONTAINER_NAME: &str = "agent";

/// Shared state handed to every reconcile invocation
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub namespace: String,
    pub config: Arc<ControllerConfig>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub traces: Arc<dyn TraceAdapter>,
    pub events: Arc<dyn EventPublisher>,
    pub metrics: Arc<LearningMetrics>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Object is missing a name or namespace")]
    MissingObjectKey,

    #[error("Synthesis failed: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("Synthesis returned validation errors: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),

    #[error(transparent)]
    Rollout(#[from] RolloutError),

    #[error("Artifact store error: {0}")]
    Artifact(String),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("Self-healing exhausted after {attempts} attempts")]
    SelfHealingExhausted { attempts: i32 },

    #[error("Learning status for task '{task}' could not be decoded: {reason}")]
    StatusDecode { task: String, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
