//! Volume types and volume source construction
//!
//! A backup storage location's config map (`bucket`, `path`, `server`, ...)
//! is turned into a typed [`LocalVolumeSource`] and from there into the
//! Kubernetes `Volume` that gets mounted into the velero and restic pods.
//! PVC-backed locations also get their claim created on first use.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::{
    HostPathVolumeSource, NFSVolumeSource, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info};

use crate::cluster::ClusterClient;
use crate::{Error, StepContext};

/// Label key applied to claims this provider creates
pub const VOLUME_PROVIDER_LABEL_KEY: &str = "app";

/// Label value applied to claims this provider creates
pub const VOLUME_PROVIDER_LABEL_VALUE: &str = "velero";

/// Host path type used for hostpath volumes
const HOST_PATH_TYPE_DIRECTORY: &str = "Directory";

/// Access mode requested for provisioned claims
const ACCESS_MODE_READ_WRITE_MANY: &str = "ReadWriteMany";

/// The kind of local volume an object store instance is backed by
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VolumeType {
    /// A directory on the node
    Hostpath,
    /// An NFS export
    Nfs,
    /// A PersistentVolumeClaim created on demand
    Pvc,
}

impl VolumeType {
    /// Every supported volume type
    pub const ALL: [VolumeType; 3] = [VolumeType::Hostpath, VolumeType::Nfs, VolumeType::Pvc];

    /// Lowercase name used in plugin names and label selectors
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeType::Hostpath => "hostpath",
            VolumeType::Nfs => "nfs",
            VolumeType::Pvc => "pvc",
        }
    }

    /// Name the object store plugin is registered under (e.g. `replicated.com/nfs`)
    pub fn plugin_name(&self) -> String {
        format!("replicated.com/{}", self.as_str())
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeType {
    type Err = Error;

    /// Accepts the short name (`nfs`) or the plugin name (`replicated.com/nfs`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VolumeType::ALL
            .into_iter()
            .find(|vt| s == vt.as_str() || s == vt.plugin_name())
            .ok_or_else(|| Error::UnrecognizedVolumeType(s.to_string()))
    }
}

/// Where a local volume's data lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalVolumeSource {
    /// Directory on the node
    HostPath {
        /// Absolute path on the host
        path: String,
    },
    /// NFS export
    Nfs {
        /// NFS server address
        server: String,
        /// Exported path
        path: String,
    },
    /// Existing or provisioned claim
    Pvc {
        /// Claim name
        claim_name: String,
    },
}

impl LocalVolumeSource {
    /// Build the source for a volume type from a storage location's config
    ///
    /// This is pure: for PVCs it only names the claim, see [`build_volume`]
    /// for the variant that also provisions it.
    pub fn from_config(
        volume_type: VolumeType,
        config: &BTreeMap<String, String>,
    ) -> Result<Self, Error> {
        match volume_type {
            VolumeType::Hostpath => Ok(LocalVolumeSource::HostPath {
                path: required(config, "path")?,
            }),
            VolumeType::Nfs => Ok(LocalVolumeSource::Nfs {
                path: required(config, "path")?,
                server: required(config, "server")?,
            }),
            VolumeType::Pvc => Ok(LocalVolumeSource::Pvc {
                claim_name: required(config, "bucket")?,
            }),
        }
    }

    /// Convert into a Kubernetes volume with the given name
    pub fn into_volume(self, name: impl Into<String>) -> Volume {
        let mut volume = Volume {
            name: name.into(),
            ..Default::default()
        };
        match self {
            LocalVolumeSource::HostPath { path } => {
                volume.host_path = Some(HostPathVolumeSource {
                    path,
                    type_: Some(HOST_PATH_TYPE_DIRECTORY.to_string()),
                });
            }
            LocalVolumeSource::Nfs { server, path } => {
                volume.nfs = Some(NFSVolumeSource {
                    path,
                    server,
                    read_only: None,
                });
            }
            LocalVolumeSource::Pvc { claim_name } => {
                volume.persistent_volume_claim = Some(PersistentVolumeClaimVolumeSource {
                    claim_name,
                    read_only: None,
                });
            }
        }
        volume
    }
}

#[cfg(test)]
impl LocalVolumeSource {
    /// Read the source back out of a Kubernetes volume, if it is one of ours
    pub(crate) fn from_volume(volume: &Volume) -> Option<Self> {
        if let Some(hp) = &volume.host_path {
            return Some(LocalVolumeSource::HostPath {
                path: hp.path.clone(),
            });
        }
        if let Some(nfs) = &volume.nfs {
            return Some(LocalVolumeSource::Nfs {
                server: nfs.server.clone(),
                path: nfs.path.clone(),
            });
        }
        volume
            .persistent_volume_claim
            .as_ref()
            .map(|pvc| LocalVolumeSource::Pvc {
                claim_name: pvc.claim_name.clone(),
            })
    }
}

fn required(config: &BTreeMap<String, String>, field: &str) -> Result<String, Error> {
    match config.get(field) {
        Some(value) if !value.is_empty() => Ok(value.clone()),
        _ => Err(Error::missing_config(field)),
    }
}

/// Build the volume for a storage location, named after its bucket
///
/// For [`VolumeType::Pvc`] the claim is created first if it does not exist.
pub async fn build_volume(
    client: &dyn ClusterClient,
    namespace: &str,
    volume_type: VolumeType,
    config: &BTreeMap<String, String>,
) -> Result<Volume, Error> {
    let name = required(config, "bucket")?;

    if volume_type == VolumeType::Pvc {
        ensure_pvc(client, namespace, config)
            .await
            .step(format!("failed to create pvc for {}", name))?;
    }

    let source = LocalVolumeSource::from_config(volume_type, config)
        .step(format!("failed to build volume for {}", volume_type))?;
    debug!(volume = %name, volume_type = %volume_type, "built volume");
    Ok(source.into_volume(name))
}

/// Build the mount for a bucket's volume
pub fn build_volume_mount(bucket: &str, mount_path: &str) -> VolumeMount {
    VolumeMount {
        name: bucket.to_string(),
        mount_path: mount_path.to_string(),
        read_only: Some(false),
        ..Default::default()
    }
}

/// Create the claim named by `config.bucket` unless it already exists
pub async fn ensure_pvc(
    client: &dyn ClusterClient,
    namespace: &str,
    config: &BTreeMap<String, String>,
) -> Result<(), Error> {
    let name = required(config, "bucket")?;

    if client
        .get_persistent_volume_claim(namespace, &name)
        .await
        .step("failed to get velero pvc")?
        .is_some()
    {
        info!(pvc = %name, "pvc already exists");
        return Ok(());
    }

    let claim = build_pvc(namespace, &name, config)?;
    match client.create_persistent_volume_claim(namespace, &claim).await {
        Ok(()) => {
            info!(pvc = %name, namespace = %namespace, "created pvc");
            Ok(())
        }
        // Someone else created it between our get and create
        Err(Error::AlreadyExists { .. }) => Ok(()),
        Err(e) => Err(e).step("failed to create velero pvc"),
    }
}

fn build_pvc(
    namespace: &str,
    name: &str,
    config: &BTreeMap<String, String>,
) -> Result<PersistentVolumeClaim, Error> {
    let storage_size = required(config, "storageSize")?;

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                VOLUME_PROVIDER_LABEL_KEY.to_string(),
                VOLUME_PROVIDER_LABEL_VALUE.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![ACCESS_MODE_READ_WRITE_MANY.to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage_size),
                )])),
                ..Default::default()
            }),
            storage_class_name: config.get("storageClassName").cloned(),
            ..Default::default()
        }),
        ..Default::default()
    })
}
