//! Audit events attached to `LanguageAgent` objects

use crate::crds::LanguageAgent;
use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::{debug, warn};

/// Severity of an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// Human-readable audit event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub severity: EventSeverity,
    pub reason: String,
    pub message: String,
}

impl AuditEvent {
    pub fn normal(reason: &str, message: impl Into<String>) -> Self {
        Self {
            severity: EventSeverity::Normal,
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn warning(reason: &str, message: impl Into<String>) -> Self {
        Self {
            severity: EventSeverity::Warning,
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

/// Sink for audit events. Publishing never fails the caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, agent: &LanguageAgent, event: AuditEvent);
}

/// Publishes events through the Kubernetes events API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    #[must_use]
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, agent: &LanguageAgent, event: AuditEvent) {
        let reference = agent.object_ref(&());
        let kube_event = Event {
            type_: match event.severity {
                EventSeverity::Normal => EventType::Normal,
                EventSeverity::Warning => EventType::Warning,
            },
            reason: event.reason.clone(),
            note: Some(event.message.clone()),
            action: "Reconcile".to_string(),
            secondary: None,
        };

        match self.recorder.publish(&kube_event, &reference).await {
            Ok(()) => debug!(reason = %event.reason, "Published agent event"),
            Err(e) => warn!(
                reason = %event.reason,
                error = %e,
                "Failed to publish agent event"
            ),
        }
    }
}
