//! Filesystem-backed object store
//!
//! Velero talks to an object store in terms of buckets and keys. Here a
//! bucket is a directory under the volume root (where its volume is
//! mounted) and a key is a relative path inside it.

use std::collections::BTreeMap;
use std::fs::{self, DirBuilder, File};
use std::io::{self, Read};
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};
use url::Url;

use crate::cluster::ClusterClient;
use crate::options::PluginOptions;
use crate::reconcile::{EnsureOutcome, EnsureRequest, Reconciler};
use crate::signing::{SigningKeyStore, UrlSigner};
use crate::volume::VolumeType;
use crate::{Error, StepContext, DEFAULT_VOLUME_ROOT, FILE_SERVER_PORT};

/// Subdirectories velero expects in a backup storage location
pub const SUBDIRECTORY_LAYOUT: [&str; 5] = ["backups", "restores", "restic", "metadata", "plugins"];

/// Directory names never reported as common prefixes
pub const DIRECTORY_DENY_LIST: [&str; 1] = ["lost+found"];

/// Object store for one volume type, rooted at the local mount root
pub struct LocalVolumeObjectStore {
    client: Arc<dyn ClusterClient>,
    volume_type: VolumeType,
    namespace: String,
    root: PathBuf,
    pod_ip: String,
    signer: UrlSigner,
}

impl LocalVolumeObjectStore {
    /// Create a store for `volume_type` with velero running in `namespace`
    pub fn new(
        client: Arc<dyn ClusterClient>,
        volume_type: VolumeType,
        namespace: impl Into<String>,
    ) -> Self {
        let signer = UrlSigner::new(SigningKeyStore::new(client.clone()));
        Self {
            client,
            volume_type,
            namespace: namespace.into(),
            root: PathBuf::from(DEFAULT_VOLUME_ROOT),
            pod_ip: String::new(),
            signer,
        }
    }

    /// Use a different volume root
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Set the velero pod IP that signed URLs point at
    pub fn with_pod_ip(mut self, pod_ip: impl Into<String>) -> Self {
        self.pod_ip = pod_ip.into();
        self
    }

    /// Volume root all buckets live under
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Prepare a bucket: load options, lay out the directory, and reconcile workloads
    ///
    /// Safe to call repeatedly.
    pub async fn init(&self, config: &BTreeMap<String, String>) -> Result<EnsureOutcome, Error> {
        let bucket = config.get("bucket").cloned().unwrap_or_default();
        let prefix = config.get("prefix").cloned().unwrap_or_default();
        let path = self.root.join(&bucket);
        debug!(bucket = %bucket, prefix = %prefix, path = %path.display(), "init called");

        let options = PluginOptions::load(self.client.as_ref(), &self.namespace, self.volume_type)
            .await
            .step("failed to get local volume configuration")?;

        ensure_filesystem(&path, &prefix).step("failed to ensure filesystem")?;

        let reconciler = Reconciler::new(
            self.client.clone(),
            self.namespace.clone(),
            self.root.to_string_lossy(),
        );
        let request = EnsureRequest {
            bucket,
            prefix,
            local_path: path.to_string_lossy().into_owned(),
            config: config.clone(),
            volume_type: self.volume_type,
            options,
        };
        reconciler
            .ensure_resources(&request)
            .await
            .step("failed to ensure resources")
    }

    /// Write an object, creating parent directories
    pub fn put_object(&self, bucket: &str, key: &str, body: &mut dyn Read) -> Result<(), Error> {
        let path = self.object_path(bucket, &[key])?;
        debug!(bucket = %bucket, key = %key, path = %path.display(), "put object");

        if let Some(dir) = path.parent() {
            create_dir_all(dir)?;
        }
        let mut file = File::create(&path).map_err(|e| Error::filesystem(&path, e))?;
        io::copy(body, &mut file).map_err(|e| Error::filesystem(&path, e))?;
        Ok(())
    }

    /// Whether an object exists
    pub fn object_exists(&self, bucket: &str, key: &str) -> Result<bool, Error> {
        let path = self.object_path(bucket, &[key])?;
        match fs::metadata(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::filesystem(&path, e)),
        }
    }

    /// Open an object for reading
    pub fn get_object(&self, bucket: &str, key: &str) -> Result<File, Error> {
        let path = self.object_path(bucket, &[key])?;
        debug!(bucket = %bucket, key = %key, "get object");
        File::open(&path).map_err(|e| Error::filesystem(&path, e))
    }

    /// Subdirectories of `<bucket>/<prefix>/<delimiter>`
    pub fn list_common_prefixes(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: &str,
    ) -> Result<Vec<String>, Error> {
        let path = self.object_path(bucket, &[prefix, delimiter])?;
        let mut dirs = Vec::new();
        for entry in read_dir_sorted(&path)? {
            let is_dir = entry
                .file_type()
                .map_err(|e| Error::filesystem(entry.path(), e))?
                .is_dir();
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_dir && !DIRECTORY_DENY_LIST.contains(&name.as_str()) {
                dirs.push(name);
            }
        }
        Ok(dirs)
    }

    /// Every entry directly under `<bucket>/<prefix>`, as keys
    pub fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, Error> {
        let path = self.object_path(bucket, &[prefix])?;
        Ok(read_dir_sorted(&path)?
            .iter()
            .map(|entry| join_key(prefix, &entry.file_name().to_string_lossy()))
            .collect())
    }

    /// Remove an object
    ///
    /// Once the last file of a backup (`<k0>/<k1>/...`) is gone its
    /// directory is removed too.
    pub fn delete_object(&self, bucket: &str, key: &str) -> Result<(), Error> {
        let path = self.object_path(bucket, &[key])?;
        debug!(bucket = %bucket, key = %key, path = %path.display(), "delete object");
        fs::remove_file(&path).map_err(|e| Error::filesystem(&path, e))?;

        let parts: Vec<&str> = key.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() < 3 {
            return Ok(());
        }
        let backup_path = self.object_path(bucket, &[parts[0], parts[1]])?;
        let mut entries = fs::read_dir(&backup_path).map_err(|e| Error::filesystem(&backup_path, e))?;
        if entries.next().is_none() {
            fs::remove_dir(&backup_path).map_err(|e| Error::filesystem(&backup_path, e))?;
            debug!(backup_path = %backup_path.display(), "deleted backup directory");
        }
        Ok(())
    }

    /// Signed URL on the sidecar file server for an object
    ///
    /// Bucket and key segments are percent-encoded, so keys holding `?`,
    /// `#` or spaces still name the object they were minted for.
    pub async fn create_signed_url(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, Error> {
        self.object_path(bucket, &[key])?;

        let base = format!("http://{}:{}/", self.pod_ip, FILE_SERVER_PORT);
        let mut url = Url::parse(&base).map_err(|e| Error::InvalidUrl {
            url: base.clone(),
            message: e.to_string(),
        })?;
        url.path_segments_mut()
            .map_err(|_| Error::InvalidUrl {
                url: base.clone(),
                message: "cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .push(bucket)
            .extend(key.split('/').filter(|segment| !matches!(*segment, "" | ".")));

        self.signer
            .sign(url.as_str(), &self.namespace, ttl)
            .await
            .step("failed to create signed url")
    }

    fn object_path(&self, bucket: &str, parts: &[&str]) -> Result<PathBuf, Error> {
        let mut all = Vec::with_capacity(parts.len() + 1);
        all.push(bucket);
        all.extend_from_slice(parts);
        join_clean(&self.root, &all)
    }
}

/// Check the bucket directory and lay out velero's subdirectories under the prefix
///
/// A missing directory is fine: the volume is not mounted until the
/// reconciled workload restarts, and the next init lays it out.
pub fn ensure_filesystem(path: &Path, prefix: &str) -> Result<(), Error> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "bucket volume does not exist yet");
            return Ok(());
        }
        Err(e) => return Err(Error::filesystem(path, e)),
    };

    let (euid, egid) = effective_ids();
    if !is_writable(meta.mode(), meta.uid(), meta.gid(), euid, egid) {
        error!(
            path = %path.display(),
            mode = %format!("{:o}", meta.mode() & 0o777),
            owner_uid = meta.uid(),
            owner_gid = meta.gid(),
            euid,
            egid,
            "directory is not writable"
        );
        return Err(Error::filesystem(
            path,
            io::Error::new(io::ErrorKind::PermissionDenied, "directory is not writable"),
        ));
    }

    for subdir in SUBDIRECTORY_LAYOUT {
        create_dir_all(&join_clean(path, &[prefix, subdir])?)?;
    }
    Ok(())
}

/// Whether a directory with this mode and owner is writable by the effective ids
///
/// Running with effective gid 0 is always treated as writable.
pub fn is_writable(mode: u32, owner_uid: u32, owner_gid: u32, euid: u32, egid: u32) -> bool {
    let perm = mode & 0o777;
    perm & 0o002 != 0
        || (perm & 0o200 != 0 && owner_uid == euid)
        || (perm & 0o020 != 0 && owner_gid == egid)
        || egid == 0
}

fn effective_ids() -> (u32, u32) {
    // SAFETY: geteuid/getegid have no preconditions and cannot fail
    unsafe { (libc::geteuid(), libc::getegid()) }
}

fn create_dir_all(path: &Path) -> Result<(), Error> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
        .map_err(|e| Error::filesystem(path, e))
}

fn read_dir_sorted(path: &Path) -> Result<Vec<fs::DirEntry>, Error> {
    let mut entries = fs::read_dir(path)
        .and_then(|it| it.collect::<io::Result<Vec<_>>>())
        .map_err(|e| Error::filesystem(path, e))?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

/// Join slash-separated parts under `base`, skipping empty and `.` segments
///
/// `..` is rejected so keys cannot escape the volume root.
fn join_clean(base: &Path, parts: &[&str]) -> Result<PathBuf, Error> {
    let mut path = base.to_path_buf();
    for part in parts {
        for segment in part.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    return Err(Error::invalid_config(
                        "key",
                        format!("{:?} must not contain '..'", part),
                    ))
                }
                s => path.push(s),
            }
        }
    }
    Ok(path)
}

fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}
