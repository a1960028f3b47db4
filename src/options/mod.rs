//! Plugin options
//!
//! Operators tune the provider with an optional ConfigMap in the velero
//! namespace labeled `replicated.com/<volumeType>=ObjectStore`. Its keys
//! override workload names, the sidecar image, the pod security context,
//! and which volumes survive pruning.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, PodSecurityContext};
use kube::ResourceExt;
use tracing::debug;

use crate::cluster::ClusterClient;
use crate::pod_spec::PreserveSet;
use crate::volume::VolumeType;
use crate::{
    Error, StepContext, DEFAULT_FILE_SERVER_IMAGE, DEFAULT_RESTIC_DAEMONSET_NAME,
    DEFAULT_VELERO_DEPLOYMENT_NAME,
};

/// Label value marking a ConfigMap as object store plugin config
pub const PLUGIN_KIND_OBJECT_STORE: &str = "ObjectStore";

/// Options controlling how workloads are reconciled
///
/// Empty strings mean "not set" and fall back to the defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PluginOptions {
    /// Name of the velero deployment
    pub velero_deployment_name: String,
    /// Name of the restic daemonset
    pub restic_daemonset_name: String,
    /// Image for the file server sidecar
    pub fileserver_image: String,
    /// Pod security context runAsUser
    pub security_context_run_as_user: String,
    /// Pod security context runAsGroup
    pub security_context_run_as_group: String,
    /// Pod security context fsGroup
    pub security_context_fs_group: String,
    /// Volumes to keep when pruning; pruning is off when empty
    pub preserve_volumes: PreserveSet,
}

impl PluginOptions {
    /// Label selector for this volume type's plugin ConfigMap
    pub fn label_selector(volume_type: VolumeType) -> String {
        format!(
            "replicated.com/{}={}",
            volume_type.as_str(),
            PLUGIN_KIND_OBJECT_STORE
        )
    }

    /// Look up the plugin ConfigMap and parse it
    ///
    /// No ConfigMap yields the defaults. More than one is an error.
    pub async fn load(
        client: &dyn ClusterClient,
        namespace: &str,
        volume_type: VolumeType,
    ) -> Result<Self, Error> {
        let selector = Self::label_selector(volume_type);
        let mut items = client
            .list_config_maps(namespace, &selector)
            .await
            .step("could not list config maps")?;

        match items.len() {
            0 => {
                debug!(selector = %selector, "did not find a configmap for this plugin");
                Ok(Self::default())
            }
            1 => {
                let cm = items.remove(0);
                debug!(configmap = %cm.name_any(), "found a configmap for this plugin");
                Ok(Self::from_config_map(&cm))
            }
            _ => Err(Error::AmbiguousConfig {
                selector,
                names: items.iter().map(|cm| cm.name_any()).collect(),
            }),
        }
    }

    /// Parse options from a ConfigMap's data
    pub fn from_config_map(cm: &ConfigMap) -> Self {
        let empty = BTreeMap::new();
        let data = cm.data.as_ref().unwrap_or(&empty);
        let get = |key: &str| data.get(key).cloned().unwrap_or_default();

        Self {
            velero_deployment_name: get("veleroDeploymentName"),
            restic_daemonset_name: get("resticDaemonsetName"),
            fileserver_image: get("fileserverImage"),
            security_context_run_as_user: get("securityContextRunAsUser"),
            security_context_run_as_group: get("securityContextRunAsGroup"),
            security_context_fs_group: get("securityContextFsGroup"),
            preserve_volumes: parse_preserve_volumes(&get("preserveVolumes")),
        }
    }

    /// Velero deployment name, configured or default
    pub fn velero_deployment_name(&self) -> &str {
        or_default(&self.velero_deployment_name, DEFAULT_VELERO_DEPLOYMENT_NAME)
    }

    /// Restic daemonset name, configured or default
    pub fn restic_daemonset_name(&self) -> &str {
        or_default(&self.restic_daemonset_name, DEFAULT_RESTIC_DAEMONSET_NAME)
    }

    /// File server sidecar image, configured or default
    pub fn fileserver_image(&self) -> &str {
        or_default(&self.fileserver_image, DEFAULT_FILE_SERVER_IMAGE)
    }

    /// Build the pod security context, if any security option is set
    ///
    /// Options that are not set stay unset on the context.
    pub fn pod_security_context(&self) -> Result<Option<PodSecurityContext>, Error> {
        if self.security_context_run_as_user.is_empty()
            && self.security_context_run_as_group.is_empty()
            && self.security_context_fs_group.is_empty()
        {
            return Ok(None);
        }

        Ok(Some(PodSecurityContext {
            run_as_user: parse_id("runAsUser", &self.security_context_run_as_user)?,
            run_as_group: parse_id("runAsGroup", &self.security_context_run_as_group)?,
            fs_group: parse_id("fsGroup", &self.security_context_fs_group)?,
            ..Default::default()
        }))
    }
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() {
        default
    } else {
        value
    }
}

fn parse_id(field: &str, value: &str) -> Result<Option<i64>, Error> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .trim()
        .parse::<i64>()
        .map(Some)
        .map_err(|_| Error::InvalidSecurityContextValue {
            field: field.to_string(),
            value: value.to_string(),
        })
}

/// Parse the comma separated `preserveVolumes` option
pub fn parse_preserve_volumes(raw: &str) -> PreserveSet {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
