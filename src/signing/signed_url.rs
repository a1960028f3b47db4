//! HMAC-SHA1 signed URLs with an absolute expiry

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tracing::debug;
use url::{form_urlencoded, Url};

use super::SigningKeyStore;
use crate::{Error, StepContext};

type HmacSha1 = Hmac<Sha1>;

/// Query parameter carrying the expiry timestamp
pub const EXPIRES_PARAM: &str = "expires";

/// Query parameter carrying the base64url signature
pub const SIGNATURE_PARAM: &str = "signature";

/// Expiry layout: UTC with millisecond precision, e.g. `2024-01-02T15:04:05.000Z`
pub const EXPIRY_LAYOUT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Mints and checks signed URLs using the namespaced signing key
#[derive(Clone)]
pub struct UrlSigner {
    keys: SigningKeyStore,
}

impl UrlSigner {
    /// Create a signer backed by the given key store
    pub fn new(keys: SigningKeyStore) -> Self {
        Self { keys }
    }

    /// Append `expires` and `signature` to a URL
    ///
    /// The signature covers the whole URL string including `expires`.
    pub async fn sign(&self, raw_url: &str, namespace: &str, ttl: Duration) -> Result<String, Error> {
        let mut url = parse_url(raw_url)?;

        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::invalid_config("ttl", e.to_string()))?;
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .ok_or_else(|| Error::invalid_config("ttl", "expiry out of range"))?;
        let expires = format_expiry(expires_at);
        append_query_pair(&mut url, EXPIRES_PARAM, &encode(&expires));

        let key = self
            .keys
            .get_or_create(namespace)
            .await
            .step("failed to get signing key")?;
        let signature = URL_SAFE.encode(compute_mac(&key, url.as_str())?);
        append_query_pair(&mut url, SIGNATURE_PARAM, &signature);

        Ok(url.into())
    }

    /// Check a signed URL's expiry and signature
    ///
    /// A missing `expires` or `signature`, an expired URL, or a signature
    /// mismatch yields `Ok(false)`. Only an unparseable URL, expiry, or
    /// signature encoding, or a key store failure, is an error.
    pub async fn validate(&self, raw_url: &str, namespace: &str) -> Result<bool, Error> {
        let mut url = parse_url(raw_url)?;

        let Some(expires) = query_param(&url, EXPIRES_PARAM) else {
            debug!("signed url has no expiry");
            return Ok(false);
        };
        let expires_at = parse_expiry(&expires)?;
        if expires_at < Utc::now() {
            debug!(expires = %expires, "signed url has expired");
            return Ok(false);
        }

        let Some(signature) = query_param(&url, SIGNATURE_PARAM) else {
            debug!("signed url has no signature");
            return Ok(false);
        };
        let signature = URL_SAFE
            .decode(signature.as_bytes())
            .map_err(|e| Error::MalformedSignature {
                message: e.to_string(),
            })?;

        remove_query_param(&mut url, SIGNATURE_PARAM);
        let key = self
            .keys
            .get_or_create(namespace)
            .await
            .step("failed to get signing key")?;

        let mut mac = new_mac(&key)?;
        mac.update(url.as_str().as_bytes());
        Ok(mac.verify_slice(&signature).is_ok())
    }
}

/// Format a timestamp in the expiry layout
pub fn format_expiry(at: DateTime<Utc>) -> String {
    at.format(EXPIRY_LAYOUT).to_string()
}

/// Parse a timestamp in the expiry layout
pub fn parse_expiry(value: &str) -> Result<DateTime<Utc>, Error> {
    NaiveDateTime::parse_from_str(value, EXPIRY_LAYOUT)
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::MalformedExpiry {
            value: value.to_string(),
            message: e.to_string(),
        })
}

fn parse_url(raw: &str) -> Result<Url, Error> {
    Url::parse(raw).map_err(|e| Error::InvalidUrl {
        url: raw.to_string(),
        message: e.to_string(),
    })
}

fn new_mac(key: &[u8]) -> Result<HmacSha1, Error> {
    HmacSha1::new_from_slice(key).map_err(|e| Error::InvalidSigningKey {
        name: crate::SIGNING_SECRET_NAME.to_string(),
        message: e.to_string(),
    })
}

fn compute_mac(key: &[u8], message: &str) -> Result<Vec<u8>, Error> {
    let mut mac = new_mac(key)?;
    mac.update(message.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Append an already-encoded `name=value` pair, keeping the raw query intact
fn append_query_pair(url: &mut Url, name: &str, encoded_value: &str) {
    let pair = format!("{}={}", name, encoded_value);
    let query = match url.query() {
        Some(existing) if !existing.is_empty() => format!("{}&{}", existing, pair),
        _ => pair,
    };
    url.set_query(Some(&query));
}

fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Drop every pair named `name`, leaving the other pairs byte-for-byte in order
fn remove_query_param(url: &mut Url, name: &str) {
    let kept = match url.query() {
        Some(query) => query
            .split('&')
            .filter(|pair| {
                !form_urlencoded::parse(pair.as_bytes())
                    .next()
                    .is_some_and(|(key, _)| key == name)
            })
            .collect::<Vec<_>>()
            .join("&"),
        None => return,
    };
    url.set_query(if kept.is_empty() { None } else { Some(&kept) });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::{api_error, InMemoryCluster};
    use crate::cluster::MockClusterClient;
    use std::sync::Arc;

    const HOUR: Duration = Duration::from_secs(3600);

    fn signer() -> UrlSigner {
        UrlSigner::new(SigningKeyStore::new(Arc::new(InMemoryCluster::new())))
    }

    /// Signer whose key store must never be consulted
    fn keyless_signer() -> UrlSigner {
        let mut mock = MockClusterClient::new();
        mock.expect_get_secret().never();
        mock.expect_create_secret().never();
        UrlSigner::new(SigningKeyStore::new(Arc::new(mock)))
    }

    fn future_expiry() -> String {
        encode(&format_expiry(Utc::now() + chrono::Duration::hours(1)))
    }

    #[tokio::test]
    async fn signed_url_validates() {
        let signer = signer();
        let signed = signer
            .sign("http://10.0.0.5:3000/bucket/backups/b1/b1.tar.gz", "velero", HOUR)
            .await
            .unwrap();

        assert!(signed.starts_with("http://10.0.0.5:3000/bucket/backups/b1/b1.tar.gz?expires="));
        assert!(signed.contains("%3A"));
        assert!(signed.contains("&signature="));
        assert!(signer.validate(&signed, "velero").await.unwrap());
    }

    #[tokio::test]
    async fn existing_query_is_kept_and_covered() {
        let signer = signer();
        let signed = signer
            .sign("http://host:3000/b/k?versionId=3", "velero", HOUR)
            .await
            .unwrap();

        assert!(signed.starts_with("http://host:3000/b/k?versionId=3&expires="));
        assert!(signer.validate(&signed, "velero").await.unwrap());

        let altered = signed.replace("versionId=3", "versionId=4");
        assert!(!signer.validate(&altered, "velero").await.unwrap());
    }

    #[tokio::test]
    async fn ttl_past_the_calendar_is_rejected() {
        let err = keyless_signer()
            .sign("http://host:3000/b/k", "velero", Duration::from_secs(10_000_000_000_000))
            .await
            .unwrap_err();
        match err {
            Error::InvalidConfig { field, .. } => assert_eq!(field, "ttl"),
            other => panic!("Expected InvalidConfig, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn past_expiry_is_not_valid() {
        let signer = signer();
        let signed = signer.sign("http://host:3000/b/k", "velero", HOUR).await.unwrap();

        let expires = query_param(&Url::parse(&signed).unwrap(), EXPIRES_PARAM).unwrap();
        let rewritten = signed.replace(&encode(&expires), &encode("2000-01-01T00:00:00.000Z"));
        assert_ne!(rewritten, signed);
        assert!(!signer.validate(&rewritten, "velero").await.unwrap());
    }

    #[tokio::test]
    async fn altered_signature_is_not_valid() {
        let signer = signer();
        let signed = signer.sign("http://host:3000/b/k", "velero", HOUR).await.unwrap();

        let at = signed.find("signature=").unwrap() + "signature=".len();
        let mut bytes = signed.into_bytes();
        bytes[at] = if bytes[at] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();

        assert!(!signer.validate(&tampered, "velero").await.unwrap());
    }

    #[tokio::test]
    async fn key_from_another_namespace_does_not_validate() {
        let signer = signer();
        let signed = signer.sign("http://host:3000/b/k", "velero", HOUR).await.unwrap();
        assert!(!signer.validate(&signed, "other").await.unwrap());
    }

    #[tokio::test]
    async fn missing_parameters_are_not_valid() {
        let signer = keyless_signer();
        assert!(!signer.validate("http://host:3000/b/k", "velero").await.unwrap());

        let no_signature = format!("http://host:3000/b/k?expires={}", future_expiry());
        assert!(!signer.validate(&no_signature, "velero").await.unwrap());
    }

    #[tokio::test]
    async fn malformed_expiry_is_an_error() {
        let signer = keyless_signer();
        let err = signer
            .validate("http://host:3000/b/k?expires=yesterday&signature=AAAA", "velero")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedExpiry { ref value, .. } if value == "yesterday"));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn malformed_signature_is_an_error() {
        let signer = keyless_signer();
        let raw = format!("http://host:3000/b/k?expires={}&signature=%21%21%21", future_expiry());
        let err = signer.validate(&raw, "velero").await.unwrap_err();
        assert!(matches!(err, Error::MalformedSignature { .. }));
    }

    #[tokio::test]
    async fn unparseable_url_is_an_error() {
        let err = keyless_signer().validate("not a url", "velero").await.unwrap_err();
        assert!(matches!(err, Error::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn key_store_failure_surfaces_with_step() {
        let mut mock = MockClusterClient::new();
        mock.expect_get_secret().returning(|_, _| Err(api_error(500)));
        let signer = UrlSigner::new(SigningKeyStore::new(Arc::new(mock)));

        let raw = format!(
            "http://host:3000/b/k?expires={}&signature={}",
            future_expiry(),
            URL_SAFE.encode([0u8; 20])
        );
        let err = signer.validate(&raw, "velero").await.unwrap_err();
        assert_eq!(err.steps(), vec!["failed to get signing key"]);
        assert!(!err.is_client_error());
    }

    #[test]
    fn expiry_layout_has_millisecond_precision() {
        let at = DateTime::parse_from_rfc3339("2024-03-04T05:06:07.089Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_expiry(at), "2024-03-04T05:06:07.089Z");
        assert_eq!(parse_expiry("2024-03-04T05:06:07.089Z").unwrap(), at);
    }

    #[test]
    fn removing_signature_keeps_other_pairs_in_order() {
        let mut url = Url::parse("http://h/b/k?z=1&signature=abc%3D&a=2&expires=x").unwrap();
        remove_query_param(&mut url, SIGNATURE_PARAM);
        assert_eq!(url.as_str(), "http://h/b/k?z=1&a=2&expires=x");

        let mut url = Url::parse("http://h/b/k?signature=abc").unwrap();
        remove_query_param(&mut url, SIGNATURE_PARAM);
        assert_eq!(url.as_str(), "http://h/b/k");
    }
}
