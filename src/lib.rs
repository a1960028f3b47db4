//! Local Volume Provider - a Velero object store backed by a local volume
//!
//! Instead of a cloud bucket, backups land on a hostpath, NFS export, or PVC
//! that is mounted into the Velero deployment (and the optional restic
//! daemonset). A sidecar file server exposes the volume over HTTP to
//! anonymous clients holding a signed, expiring URL.
//!
//! # Modules
//!
//! - [`cluster`] - Kubernetes API seam (Deployment, DaemonSet, Secret, PVC, ConfigMap)
//! - [`volume`] - Volume type and volume source construction
//! - [`pod_spec`] - Pure pod spec patching (volumes, mounts, env, pruning)
//! - [`options`] - Plugin options and pod security context derivation
//! - [`signing`] - Signing key store and signed URL minting/validation
//! - [`reconcile`] - Workload reconciliation for the velero/restic pods
//! - [`object_store`] - Filesystem-backed object store operations
//! - [`fileserver`] - HTTP router for the sidecar file server
//! - [`telemetry`] - Tracing subscriber setup
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod cluster;
pub mod error;
pub mod fileserver;
pub mod object_store;
pub mod options;
pub mod pod_spec;
pub mod reconcile;
pub mod signing;
pub mod telemetry;
pub mod volume;

pub use error::{Error, StepContext};

// =============================================================================
// Cluster conventions
// =============================================================================

/// Default name of the primary (velero) deployment
pub const DEFAULT_VELERO_DEPLOYMENT_NAME: &str = "velero";

/// Default name of the agent (restic) daemonset
pub const DEFAULT_RESTIC_DAEMONSET_NAME: &str = "restic";

/// Name of the container in the velero deployment that receives the mount
pub const VELERO_CONTAINER_NAME: &str = "velero";

/// Name of the sidecar file server container
pub const FILE_SERVER_CONTAINER_NAME: &str = "local-volume-provider";

/// Default sidecar image, tagged with this crate's version
pub const DEFAULT_FILE_SERVER_IMAGE: &str =
    concat!("replicated/local-volume-provider:v", env!("CARGO_PKG_VERSION"));

/// Command the sidecar container runs
pub const FILE_SERVER_COMMAND: &str = "/local-volume-fileserver";

/// Port the sidecar file server listens on
pub const FILE_SERVER_PORT: u16 = 3000;

/// Name of the secret holding the URL signing key
pub const SIGNING_SECRET_NAME: &str = "lvp-signingsecret";

/// Data field of the signing secret that holds the key bytes
pub const SIGNING_KEY_FIELD: &str = "SigningKey";

/// Volumes velero and restic rely on that pruning never removes
pub const RESERVED_VOLUME_NAMES: [&str; 4] = ["plugins", "host-pods", "scratch", "cloud-credentials"];

/// Default mount root for local volumes inside the velero pod
pub const DEFAULT_VOLUME_ROOT: &str = "/var/velero-local-volume-provider";

/// Environment variable carrying the velero namespace
pub const VELERO_NAMESPACE_ENV: &str = "VELERO_NAMESPACE";

/// Environment variable carrying the velero pod IP
pub const POD_IP_ENV: &str = "POD_IP";

/// Environment variable carrying the file server's root directory
pub const MOUNT_POINT_ENV: &str = "MOUNT_POINT";

