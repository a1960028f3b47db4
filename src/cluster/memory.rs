//! In-memory cluster for state-based tests

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret};
use kube::ResourceExt;

use super::ClusterClient;
use crate::Error;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct State {
    deployments: BTreeMap<Key, Deployment>,
    daemon_sets: BTreeMap<Key, DaemonSet>,
    secrets: BTreeMap<Key, Secret>,
    claims: BTreeMap<Key, PersistentVolumeClaim>,
    config_maps: BTreeMap<Key, ConfigMap>,
    deployment_updates: usize,
    daemon_set_updates: usize,
    secret_creates: usize,
    claim_creates: usize,
}

/// Cluster that stores objects in maps and counts writes
#[derive(Default)]
pub(crate) struct InMemoryCluster {
    state: Mutex<State>,
}

impl InMemoryCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_deployment(self, namespace: &str, deployment: Deployment) -> Self {
        self.state
            .lock()
            .unwrap()
            .deployments
            .insert(key(namespace, &deployment.name_any()), deployment);
        self
    }

    pub(crate) fn with_daemon_set(self, namespace: &str, daemon_set: DaemonSet) -> Self {
        self.state
            .lock()
            .unwrap()
            .daemon_sets
            .insert(key(namespace, &daemon_set.name_any()), daemon_set);
        self
    }

    pub(crate) fn with_config_map(self, namespace: &str, config_map: ConfigMap) -> Self {
        self.state
            .lock()
            .unwrap()
            .config_maps
            .insert(key(namespace, &config_map.name_any()), config_map);
        self
    }

    pub(crate) fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.state.lock().unwrap().deployments.get(&key(namespace, name)).cloned()
    }

    pub(crate) fn daemon_set(&self, namespace: &str, name: &str) -> Option<DaemonSet> {
        self.state.lock().unwrap().daemon_sets.get(&key(namespace, name)).cloned()
    }

    pub(crate) fn claim(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.state.lock().unwrap().claims.get(&key(namespace, name)).cloned()
    }

    pub(crate) fn deployment_updates(&self) -> usize {
        self.state.lock().unwrap().deployment_updates
    }

    pub(crate) fn daemon_set_updates(&self) -> usize {
        self.state.lock().unwrap().daemon_set_updates
    }

    pub(crate) fn secret_creates(&self) -> usize {
        self.state.lock().unwrap().secret_creates
    }

    pub(crate) fn claim_creates(&self) -> usize {
        self.state.lock().unwrap().claim_creates
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        Ok(self.deployment(namespace, name))
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state
            .deployments
            .insert(key(namespace, &deployment.name_any()), deployment.clone());
        state.deployment_updates += 1;
        Ok(())
    }

    async fn get_daemon_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DaemonSet>, Error> {
        Ok(self.daemon_set(namespace, name))
    }

    async fn replace_daemon_set(
        &self,
        namespace: &str,
        daemon_set: &DaemonSet,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state
            .daemon_sets
            .insert(key(namespace, &daemon_set.name_any()), daemon_set.clone());
        state.daemon_set_updates += 1;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self.state.lock().unwrap().secrets.get(&key(namespace, name)).cloned())
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, Error> {
        let mut state = self.state.lock().unwrap();
        let k = key(namespace, &secret.name_any());
        if state.secrets.contains_key(&k) {
            return Err(Error::AlreadyExists {
                kind: "Secret".to_string(),
                name: secret.name_any(),
            });
        }
        state.secrets.insert(k, secret.clone());
        state.secret_creates += 1;
        Ok(secret.clone())
    }

    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        Ok(self.claim(namespace, name))
    }

    async fn create_persistent_volume_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let k = key(namespace, &claim.name_any());
        if state.claims.contains_key(&k) {
            return Err(Error::AlreadyExists {
                kind: "PersistentVolumeClaim".to_string(),
                name: claim.name_any(),
            });
        }
        state.claims.insert(k, claim.clone());
        state.claim_creates += 1;
        Ok(())
    }

    async fn list_config_maps(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ConfigMap>, Error> {
        // Only equality selectors of the form `key=value` are needed here
        let (label, value) = label_selector.split_once('=').unwrap_or((label_selector, ""));
        let state = self.state.lock().unwrap();
        Ok(state
            .config_maps
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|(_, cm)| cm.labels().get(label).map(String::as_str) == Some(value))
            .map(|(_, cm)| cm.clone())
            .collect())
    }
}

/// An API server error response with the given status code
pub(crate) fn api_error(code: u16) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("server returned {}", code),
            reason: String::new(),
            code,
        }),
    }
}
