//! Signing key storage and signed URLs
//!
//! The component minting signed URLs and every file server validating them
//! may run in different processes, so the key lives in a namespaced Secret
//! and is read per call. Nothing is cached in memory.

mod signed_url;

pub use signed_url::{
    format_expiry, parse_expiry, UrlSigner, EXPIRES_PARAM, EXPIRY_LAYOUT, SIGNATURE_PARAM,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use rand::RngCore;
use tracing::{debug, info};

use crate::cluster::ClusterClient;
use crate::{Error, SIGNING_KEY_FIELD, SIGNING_SECRET_NAME};

/// Length in bytes of a generated signing key
pub const SIGNING_KEY_LEN: usize = 16;

/// Get-or-create access to the namespaced signing key
#[derive(Clone)]
pub struct SigningKeyStore {
    client: Arc<dyn ClusterClient>,
}

impl SigningKeyStore {
    /// Create a key store backed by the given cluster
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }

    /// Read the signing key, creating it on first use
    ///
    /// When two callers race to create the key, the loser reads back and
    /// returns the winner's key so both sign with the same bytes.
    pub async fn get_or_create(&self, namespace: &str) -> Result<Vec<u8>, Error> {
        if let Some(secret) = self.read(namespace).await? {
            return key_from_secret(&secret);
        }

        let key = generate_key();
        let secret = signing_secret(namespace, &key);
        match self.client.create_secret(namespace, &secret).await {
            Ok(_) => {
                info!(namespace = %namespace, secret = SIGNING_SECRET_NAME, "created signing key");
                Ok(key)
            }
            Err(Error::AlreadyExists { .. }) => {
                debug!(namespace = %namespace, "signing key created concurrently, reading it back");
                match self.read(namespace).await? {
                    Some(secret) => key_from_secret(&secret),
                    None => Err(Error::key_store(Error::InvalidSigningKey {
                        name: SIGNING_SECRET_NAME.to_string(),
                        message: "secret disappeared after create conflict".to_string(),
                    })),
                }
            }
            Err(e) => Err(Error::key_store(e)),
        }
    }

    async fn read(&self, namespace: &str) -> Result<Option<Secret>, Error> {
        self.client
            .get_secret(namespace, SIGNING_SECRET_NAME)
            .await
            .map_err(Error::key_store)
    }
}

fn generate_key() -> Vec<u8> {
    let mut key = vec![0u8; SIGNING_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

fn signing_secret(namespace: &str, key: &[u8]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(SIGNING_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            SIGNING_KEY_FIELD.to_string(),
            ByteString(key.to_vec()),
        )])),
        ..Default::default()
    }
}

fn key_from_secret(secret: &Secret) -> Result<Vec<u8>, Error> {
    let key = secret
        .data
        .as_ref()
        .and_then(|data| data.get(SIGNING_KEY_FIELD))
        .map(|bytes| bytes.0.clone())
        .unwrap_or_default();

    if key.is_empty() {
        return Err(Error::InvalidSigningKey {
            name: SIGNING_SECRET_NAME.to_string(),
            message: format!("missing or empty {} field", SIGNING_KEY_FIELD),
        });
    }
    Ok(key)
}
