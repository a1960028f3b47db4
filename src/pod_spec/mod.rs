//! Pure pod spec patching
//!
//! These functions edit a caller-owned copy of a pod spec or container and
//! never touch the cluster. Each one is idempotent: applying it twice leaves
//! the same result as applying it once.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec, Volume, VolumeMount,
};

use crate::RESERVED_VOLUME_NAMES;

/// Volume names to keep when pruning, in addition to [`RESERVED_VOLUME_NAMES`]
pub type PreserveSet = BTreeSet<String>;

/// Whether a volume name is always kept by pruning
pub fn is_reserved_volume(name: &str) -> bool {
    RESERVED_VOLUME_NAMES.contains(&name)
}

/// Add a volume, or replace the source of an existing volume with the same name
///
/// Replacing in place lets a storage location change its path or server
/// without renaming the volume.
pub fn ensure_volume(spec: &mut PodSpec, volume: &Volume) {
    let volumes = spec.volumes.get_or_insert_with(Vec::new);
    match volumes.iter_mut().find(|v| v.name == volume.name) {
        Some(existing) => *existing = volume.clone(),
        None => volumes.push(volume.clone()),
    }
}

/// Whether the container already mounts a volume with this name
pub fn container_has_mount(container: &Container, name: &str) -> bool {
    container
        .volume_mounts
        .as_ref()
        .is_some_and(|mounts| mounts.iter().any(|m| m.name == name))
}

/// Append the mount unless the container already mounts a volume with its name
pub fn ensure_container_has_mount(container: &mut Container, mount: &VolumeMount) {
    if container_has_mount(container, &mount.name) {
        return;
    }
    container
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .push(mount.clone());
}

/// Whether the container already defines an env var with this name
pub fn container_has_env_var(container: &Container, name: &str) -> bool {
    container
        .env
        .as_ref()
        .is_some_and(|env| env.iter().any(|e| e.name == name))
}

/// Append an env var unless one with the same name exists; the first value wins
pub fn ensure_env_var(container: &mut Container, env_var: EnvVar) {
    if container_has_env_var(container, &env_var.name) {
        return;
    }
    container.env.get_or_insert_with(Vec::new).push(env_var);
}

/// Env var sourced from a field of the pod itself (downward API)
pub fn field_ref_env_var(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                api_version: None,
            }),
            ..Default::default()
        }),
    }
}

/// Env var with a literal value
pub fn value_env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

/// Drop every volume, and every container's mount, not named in the preserve set
///
/// Reserved volumes are always kept. Names are compared exactly, so
/// preserving `my-bucket` does not keep `my-bucket-2`.
pub fn prune_volumes(spec: &mut PodSpec, preserve: &PreserveSet) {
    let keep = |name: &str| is_reserved_volume(name) || preserve.contains(name);

    if let Some(volumes) = spec.volumes.as_mut() {
        volumes.retain(|v| keep(&v.name));
    }
    for container in spec.containers.iter_mut() {
        if let Some(mounts) = container.volume_mounts.as_mut() {
            mounts.retain(|m| keep(&m.name));
        }
    }
}

/// Find a container by name
pub fn find_container_by_name<'a>(spec: &'a PodSpec, name: &str) -> Option<&'a Container> {
    spec.containers.iter().find(|c| c.name == name)
}

/// Find a container by name for editing
pub fn find_container_by_name_mut<'a>(
    spec: &'a mut PodSpec,
    name: &str,
) -> Option<&'a mut Container> {
    spec.containers.iter_mut().find(|c| c.name == name)
}
