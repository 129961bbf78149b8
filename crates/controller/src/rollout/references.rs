//! Artifact references inside pod specs
//!
//! A workload points at its code through `ConfigMap` volumes and `envFrom`
//! sources. Only names of the exact form `{agent}-v{N}` count as artifact
//! references; anything else in the pod spec is left alone.

use k8s_openapi::api::core::v1::PodSpec;

/// Artifact name for an agent version
pub fn artifact_name(agent_name: &str, version: u32) -> String {
    format!("{agent_name}-v{version}")
}

/// Version encoded in `name` when it is an artifact of `agent_name`
pub fn artifact_version(agent_name: &str, name: &str) -> Option<u32> {
    let digits = name.strip_prefix(agent_name)?.strip_prefix("-v")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn is_artifact_name(agent_name: &str, name: &str) -> bool {
    artifact_version(agent_name, name).is_some()
}

/// First artifact reference in the pod spec, volumes before `envFrom`
pub fn find_artifact_ref(spec: &PodSpec, agent_name: &str) -> Option<String> {
    let from_volumes = spec
        .volumes
        .iter()
        .flatten()
        .filter_map(|v| v.config_map.as_ref())
        .map(|cm| cm.name.as_str())
        .find(|name| is_artifact_name(agent_name, name));

    let from_env = || {
        spec.containers
            .iter()
            .flat_map(|c| c.env_from.iter().flatten())
            .filter_map(|source| source.config_map_ref.as_ref())
            .map(|cm| cm.name.as_str())
            .find(|name| is_artifact_name(agent_name, name))
    };

    from_volumes.or_else(from_env).map(str::to_string)
}

/// Artifact reference to restore on rollback, `{agent}-v1` when none is found
pub fn original_artifact_ref(spec: &PodSpec, agent_name: &str) -> String {
    find_artifact_ref(spec, agent_name).unwrap_or_else(|| artifact_name(agent_name, 1))
}

/// Point every artifact reference at `new_name`. Returns whether anything changed.
pub fn rewrite_artifact_refs(spec: &mut PodSpec, agent_name: &str, new_name: &str) -> bool {
    let mut changed = false;

    for volume in spec.volumes.iter_mut().flatten() {
        if let Some(cm) = volume.config_map.as_mut() {
            if is_artifact_name(agent_name, &cm.name) && cm.name != new_name {
                cm.name = new_name.to_string();
                changed = true;
            }
        }
    }

    for container in &mut spec.containers {
        for source in container.env_from.iter_mut().flatten() {
            if let Some(cm) = source.config_map_ref.as_mut() {
                if is_artifact_name(agent_name, &cm.name) && cm.name != new_name {
                    cm.name = new_name.to_string();
                    changed = true;
                }
            }
        }
    }

    changed
}
