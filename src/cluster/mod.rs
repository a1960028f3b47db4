//! Kubernetes API seam
//!
//! All cluster access goes through [`ClusterClient`] so the reconciler and the
//! signing key store can be driven by an in-memory cluster in tests while
//! production code uses the real API server. Every call is a single attempt:
//! there is no retry or backoff here.

#[cfg(test)]
pub(crate) mod memory;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret};
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Trait abstracting the cluster operations the provider needs
///
/// `get_*` return `Ok(None)` when the object does not exist. `create_*`
/// return [`Error::AlreadyExists`] when the object is already present.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get a Deployment by name
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Option<Deployment>, Error>;

    /// Replace a Deployment wholesale (last write wins)
    async fn replace_deployment(&self, namespace: &str, deployment: &Deployment)
        -> Result<(), Error>;

    /// Get a DaemonSet by name
    async fn get_daemon_set(&self, namespace: &str, name: &str)
        -> Result<Option<DaemonSet>, Error>;

    /// Replace a DaemonSet wholesale (last write wins)
    async fn replace_daemon_set(&self, namespace: &str, daemon_set: &DaemonSet)
        -> Result<(), Error>;

    /// Get a Secret by name
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Create a Secret
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, Error>;

    /// Get a PersistentVolumeClaim by name
    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;

    /// Create a PersistentVolumeClaim
    async fn create_persistent_volume_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<(), Error>;

    /// List ConfigMaps matching a label selector
    async fn list_config_maps(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ConfigMap>, Error>;
}

/// Real cluster client backed by kube-rs
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new KubeClusterClient wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the in-cluster service account or local kubeconfig
    pub async fn try_default() -> Result<Self, Error> {
        Ok(Self::new(Client::try_default().await?))
    }
}

/// Map a 404 from a get call to `None`
fn not_found_as_none<K>(result: Result<K, kube::Error>) -> Result<Option<K>, Error> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Map a 409 from a create call to [`Error::AlreadyExists`]
fn conflict_as_already_exists<K>(
    result: Result<K, kube::Error>,
    kind: &str,
    name: &str,
) -> Result<K, Error> {
    match result {
        Ok(obj) => Ok(obj),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Err(Error::AlreadyExists {
            kind: kind.to_string(),
            name: name.to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        not_found_as_none(api.get(name).await)
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let name = deployment.name_any();
        api.replace(&name, &PostParams::default(), deployment).await?;
        debug!(deployment = %name, namespace = %namespace, "replaced deployment");
        Ok(())
    }

    async fn get_daemon_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DaemonSet>, Error> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        not_found_as_none(api.get(name).await)
    }

    async fn replace_daemon_set(
        &self,
        namespace: &str,
        daemon_set: &DaemonSet,
    ) -> Result<(), Error> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        let name = daemon_set.name_any();
        api.replace(&name, &PostParams::default(), daemon_set).await?;
        debug!(daemonset = %name, namespace = %namespace, "replaced daemonset");
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        not_found_as_none(api.get(name).await)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = secret.name_any();
        conflict_as_already_exists(
            api.create(&PostParams::default(), secret).await,
            "Secret",
            &name,
        )
    }

    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        not_found_as_none(api.get(name).await)
    }

    async fn create_persistent_volume_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<(), Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let name = claim.name_any();
        conflict_as_already_exists(
            api.create(&PostParams::default(), claim).await,
            "PersistentVolumeClaim",
            &name,
        )?;
        Ok(())
    }

    async fn list_config_maps(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }
}
