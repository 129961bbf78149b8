//! Typed replica counts and the convergence step

use super::RolloutError;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

/// Replica counts read from a `Deployment`. Count fields the API server omits
/// are zero; a missing status block or generation is a decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaCounts {
    pub desired: i32,
    pub updated: i32,
    pub ready: i32,
    pub available: i32,
    pub unavailable: i32,
    /// Whether the controller has observed the latest spec
    pub observed: bool,
}

impl ReplicaCounts {
    pub fn from_deployment(deployment: &Deployment) -> Result<Self, RolloutError> {
        let name = deployment.name_any();
        let malformed = |field: &str| RolloutError::MalformedStatus {
            workload: name.clone(),
            field: field.to_string(),
        };

        let status = deployment.status.as_ref().ok_or_else(|| malformed("status"))?;
        let generation = deployment
            .metadata
            .generation
            .ok_or_else(|| malformed("metadata.generation"))?;
        let observed_generation = status
            .observed_generation
            .ok_or_else(|| malformed("status.observedGeneration"))?;

        let desired = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1);

        Ok(Self {
            desired,
            updated: status.updated_replicas.unwrap_or(0),
            ready: status.ready_replicas.unwrap_or(0),
            available: status.available_replicas.unwrap_or(0),
            unavailable: status.unavailable_replicas.unwrap_or(0),
            observed: observed_generation >= generation,
        })
    }

    /// Every desired replica is updated, ready and available
    pub fn converged(&self) -> bool {
        self.observed
            && self.updated == self.desired
            && self.ready == self.desired
            && self.available == self.desired
    }

    /// Post-rollout health check
    pub fn healthy(&self) -> Result<(), String> {
        if self.ready == 0 {
            return Err("no ready replicas".to_string());
        }
        if self.unavailable > 0 {
            return Err(format!("{} unavailable replicas", self.unavailable));
        }
        Ok(())
    }
}

/// Outcome of one poll while waiting for convergence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Converged,
    Pending,
    TimedOut,
}

/// Decide the next step from the latest counts. Undecodable counts never converge.
pub fn evaluate_wait(
    counts: Option<&ReplicaCounts>,
    now: DateTime<Utc>,
    deadline: DateTime<Utc>,
) -> WaitOutcome {
    if counts.is_some_and(ReplicaCounts::converged) {
        return WaitOutcome::Converged;
    }
    if now >= deadline {
        return WaitOutcome::TimedOut;
    }
    WaitOutcome::Pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use kube::api::ObjectMeta;

    fn deployment(replicas: i32, status: Option<DeploymentStatus>) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("bot".to_string()),
                generation: Some(3),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status,
        }
    }

    fn status(updated: i32, ready: i32, available: i32) -> DeploymentStatus {
        DeploymentStatus {
            observed_generation: Some(3),
            replicas: Some(updated.max(ready)),
            updated_replicas: Some(updated),
            ready_replicas: Some(ready),
            available_replicas: Some(available),
            ..Default::default()
        }
    }

    #[test]
    fn converges_when_all_counts_match() {
        let counts = ReplicaCounts::from_deployment(&deployment(2, Some(status(2, 2, 2)))).unwrap();
        assert!(counts.converged());
        assert!(counts.healthy().is_ok());

        let partial =
            ReplicaCounts::from_deployment(&deployment(2, Some(status(1, 2, 2)))).unwrap();
        assert!(!partial.converged());
    }

    #[test]
    fn stale_generation_is_not_converged() {
        let mut s = status(1, 1, 1);
        s.observed_generation = Some(2);
        let counts = ReplicaCounts::from_deployment(&deployment(1, Some(s))).unwrap();
        assert!(!counts.converged());
    }

    #[test]
    fn missing_status_fails_closed() {
        let err = ReplicaCounts::from_deployment(&deployment(1, None)).unwrap_err();
        assert!(matches!(err, RolloutError::MalformedStatus { ref field, .. } if field == "status"));

        let mut s = status(1, 1, 1);
        s.observed_generation = None;
        assert!(ReplicaCounts::from_deployment(&deployment(1, Some(s))).is_err());
    }

    #[test]
    fn health_requires_ready_and_no_unavailable() {
        let mut counts =
            ReplicaCounts::from_deployment(&deployment(1, Some(status(1, 1, 1)))).unwrap();
        counts.unavailable = 1;
        assert_eq!(counts.healthy().unwrap_err(), "1 unavailable replicas");
        counts.ready = 0;
        assert_eq!(counts.healthy().unwrap_err(), "no ready replicas");
    }

    #[test]
    fn wait_step_times_out_at_deadline() {
        let deadline = Utc.with_ymd_and_hms(2025, 1, 1, 12, 5, 0).unwrap();
        let before = deadline - chrono::Duration::seconds(5);
        let counts = ReplicaCounts::from_deployment(&deployment(2, Some(status(1, 1, 1)))).unwrap();

        assert_eq!(evaluate_wait(Some(&counts), before, deadline), WaitOutcome::Pending);
        assert_eq!(evaluate_wait(None, before, deadline), WaitOutcome::Pending);
        assert_eq!(evaluate_wait(Some(&counts), deadline, deadline), WaitOutcome::TimedOut);

        let done = ReplicaCounts::from_deployment(&deployment(2, Some(status(2, 2, 2)))).unwrap();
        assert_eq!(evaluate_wait(Some(&done), deadline, deadline), WaitOutcome::Converged);
    }
}
