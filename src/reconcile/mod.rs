//! Workload reconciliation
//!
//! Attaches a bucket's volume to the velero deployment (and the restic
//! daemonset when it exists), injects the sidecar file server, and writes
//! both workloads back. Each workload is read, patched in memory with the
//! pure functions in [`crate::pod_spec`], and replaced wholesale.
//!
//! The daemonset is persisted before the deployment. A failure after the
//! first write leaves the daemonset updated; nothing is rolled back.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PodSecurityContext, PodSpec, Volume, VolumeMount,
};
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::options::PluginOptions;
use crate::pod_spec::{
    ensure_container_has_mount, ensure_env_var, ensure_volume, field_ref_env_var,
    find_container_by_name_mut, prune_volumes, value_env_var,
};
use crate::volume::{build_volume, build_volume_mount, VolumeType};
use crate::{
    Error, StepContext, FILE_SERVER_COMMAND, FILE_SERVER_CONTAINER_NAME, MOUNT_POINT_ENV,
    POD_IP_ENV, VELERO_CONTAINER_NAME, VELERO_NAMESPACE_ENV,
};

/// Inputs for one reconciliation of a bucket
#[derive(Clone, Debug)]
pub struct EnsureRequest {
    /// Bucket name; also the volume name
    pub bucket: String,
    /// Prefix inside the bucket
    pub prefix: String,
    /// Mount path of the volume inside the containers
    pub local_path: String,
    /// Volume config from the backup storage location
    pub config: BTreeMap<String, String>,
    /// Kind of volume backing the bucket
    pub volume_type: VolumeType,
    /// Plugin options
    pub options: PluginOptions,
}

/// What a reconciliation did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Workloads were patched and persisted
    Applied,
    /// `preserveVolumes` is set and does not name the bucket; nothing changed
    SkippedNotPreserved,
}

/// Reconciles the velero and restic workloads for a bucket
pub struct Reconciler {
    client: Arc<dyn ClusterClient>,
    namespace: String,
    mount_root: String,
}

impl Reconciler {
    /// Create a reconciler for workloads in `namespace`
    ///
    /// `mount_root` is passed to the sidecar as its `MOUNT_POINT`.
    pub fn new(
        client: Arc<dyn ClusterClient>,
        namespace: impl Into<String>,
        mount_root: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            mount_root: mount_root.into(),
        }
    }

    /// Make sure the bucket's volume is mounted and the file server is running
    pub async fn ensure_resources(&self, req: &EnsureRequest) -> Result<EnsureOutcome, Error> {
        let opts = &req.options;
        let ns = self.namespace.as_str();

        let mut restic = self
            .client
            .get_daemon_set(ns, opts.restic_daemonset_name())
            .await
            .step("could not get restic daemonset")?;
        if restic.is_none() {
            debug!(daemonset = %opts.restic_daemonset_name(), "restic daemonset not found, skipping");
        }

        let mut velero = self
            .client
            .get_deployment(ns, opts.velero_deployment_name())
            .await
            .and_then(|d| {
                d.ok_or_else(|| Error::PrimaryWorkloadNotFound {
                    name: opts.velero_deployment_name().to_string(),
                })
            })
            .step("could not get velero deployment")?;

        if !opts.preserve_volumes.is_empty() {
            if !opts.preserve_volumes.contains(&req.bucket) {
                warn!(
                    bucket = %req.bucket,
                    "preserveVolumes was specified but does not include this bucket; the volume will not be created or mounted"
                );
                return Ok(EnsureOutcome::SkippedNotPreserved);
            }
            if let Some(ds) = restic.as_mut() {
                prune_volumes(daemon_set_pod_spec(ds), &opts.preserve_volumes);
            }
            prune_volumes(deployment_pod_spec(&mut velero), &opts.preserve_volumes);
        }

        let security_context = opts
            .pod_security_context()
            .step("unable to get security context")?;

        let volume = build_volume(self.client.as_ref(), ns, req.volume_type, &req.config)
            .await
            .step("failed to build volume")?;
        let mount = build_volume_mount(&req.bucket, &req.local_path);

        if let Some(mut ds) = restic {
            ensure_agent_has_volume(
                daemon_set_pod_spec(&mut ds),
                &volume,
                &mount,
                security_context.as_ref(),
            )
            .step("failed to ensure restic daemonset has volume")?;
            self.client
                .replace_daemon_set(ns, &ds)
                .await
                .step("unable to update restic daemonset")?;
            info!(bucket = %req.bucket, daemonset = %opts.restic_daemonset_name(), "updated restic daemonset");
        }

        let spec = deployment_pod_spec(&mut velero);
        ensure_primary_has_volume(spec, &volume, &mount)
            .step("failed to ensure velero deployment has volume")?;
        if let Some(ctx) = security_context {
            spec.security_context = Some(ctx);
        }
        self.ensure_file_server(spec, &mount, opts.fileserver_image());

        self.client
            .replace_deployment(ns, &velero)
            .await
            .step("unable to update velero deployment")?;
        info!(bucket = %req.bucket, deployment = %opts.velero_deployment_name(), "updated velero deployment");

        Ok(EnsureOutcome::Applied)
    }

    /// Add the sidecar with this mount, or add the mount to an existing sidecar
    fn ensure_file_server(&self, spec: &mut PodSpec, mount: &VolumeMount, image: &str) {
        match find_container_by_name_mut(spec, FILE_SERVER_CONTAINER_NAME) {
            Some(sidecar) => {
                ensure_container_has_mount(sidecar, mount);
                for var in self.file_server_env() {
                    ensure_env_var(sidecar, var);
                }
            }
            None => {
                debug!(image = %image, "adding file server sidecar");
                spec.containers.push(self.file_server_container(image, mount));
            }
        }
    }

    fn file_server_env(&self) -> Vec<EnvVar> {
        vec![
            value_env_var(MOUNT_POINT_ENV, &self.mount_root),
            field_ref_env_var(VELERO_NAMESPACE_ENV, "metadata.namespace"),
        ]
    }

    fn file_server_container(&self, image: &str, mount: &VolumeMount) -> Container {
        Container {
            name: FILE_SERVER_CONTAINER_NAME.to_string(),
            image: Some(image.to_string()),
            command: Some(vec![FILE_SERVER_COMMAND.to_string()]),
            env: Some(self.file_server_env()),
            volume_mounts: Some(vec![mount.clone()]),
            ..Default::default()
        }
    }
}

/// Volume, security context, and mount on the agent's single container
fn ensure_agent_has_volume(
    spec: &mut PodSpec,
    volume: &Volume,
    mount: &VolumeMount,
    security_context: Option<&PodSecurityContext>,
) -> Result<(), Error> {
    ensure_volume(spec, volume);
    if let Some(ctx) = security_context {
        spec.security_context = Some(ctx.clone());
    }
    let container = spec
        .containers
        .first_mut()
        .ok_or_else(|| Error::container_not_found("daemonset", "index 0"))?;
    ensure_container_has_mount(container, mount);
    Ok(())
}

/// Volume, mount, and `POD_IP` on the velero container
fn ensure_primary_has_volume(
    spec: &mut PodSpec,
    volume: &Volume,
    mount: &VolumeMount,
) -> Result<(), Error> {
    ensure_volume(spec, volume);
    let container = find_container_by_name_mut(spec, VELERO_CONTAINER_NAME)
        .ok_or_else(|| Error::container_not_found("deployment", VELERO_CONTAINER_NAME))?;
    ensure_container_has_mount(container, mount);
    ensure_env_var(container, field_ref_env_var(POD_IP_ENV, "status.podIP"));
    Ok(())
}

fn deployment_pod_spec(deployment: &mut Deployment) -> &mut PodSpec {
    deployment
        .spec
        .get_or_insert_with(Default::default)
        .template
        .spec
        .get_or_insert_with(Default::default)
}

fn daemon_set_pod_spec(daemon_set: &mut DaemonSet) -> &mut PodSpec {
    daemon_set
        .spec
        .get_or_insert_with(Default::default)
        .template
        .spec
        .get_or_insert_with(Default::default)
}
