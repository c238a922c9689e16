//! Identity provider key set (JWKS) retrieval.
//!
//! The key set is fetched once at startup and then shared read-only by every
//! request. There is no refresh: rotating keys requires a restart.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

/// The discovery endpoint could not produce a usable key set.
#[derive(Debug, Error)]
pub enum KeySetError {
    #[error("KeySetUnavailable: {0}")]
    Unavailable(String),
}

/// One public signing key published by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SigningKey {
    #[serde(rename = "kid")]
    pub key_id: String,
    #[serde(rename = "kty")]
    pub key_type: String,
    #[serde(rename = "use", default)]
    pub usage: String,
    /// RSA modulus (base64url encoded)
    #[serde(rename = "n", default)]
    pub modulus: String,
    /// RSA exponent (base64url encoded)
    #[serde(rename = "e", default)]
    pub exponent: String,
}

/// Wire shape of `/.well-known/jwks.json`. A body without `keys` fails to parse.
#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<SigningKey>,
}

/// Point-in-time snapshot of the provider's keys, indexed by key id.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: HashMap<String, SigningKey>,
}

impl KeySet {
    pub fn from_keys(keys: impl IntoIterator<Item = SigningKey>) -> Self {
        Self {
            keys: keys.into_iter().map(|k| (k.key_id.clone(), k)).collect(),
        }
    }

    pub fn get(&self, key_id: &str) -> Option<&SigningKey> {
        self.keys.get(key_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Fetches the key set from the provider's discovery URL.
pub struct KeyResolver {
    jwks_url: String,
    http_client: Client,
}

impl KeyResolver {
    pub fn new(jwks_url: impl Into<String>, timeout: Duration) -> Result<Self, KeySetError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KeySetError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            jwks_url: jwks_url.into(),
            http_client,
        })
    }

    /// Fetch the current key set.
    ///
    /// Unreachable endpoints, non-success statuses, bodies without a `keys`
    /// field and empty key lists all yield [`KeySetError::Unavailable`].
    pub async fn resolve(&self) -> Result<KeySet, KeySetError> {
        info!(jwks_url = %self.jwks_url, "jwks_fetching");

        let response = self
            .http_client
            .get(&self.jwks_url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| self.unavailable(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.unavailable(format!("HTTP {}", status)));
        }

        let document: JwksDocument = response
            .json()
            .await
            .map_err(|e| self.unavailable(format!("invalid JWKS document: {}", e)))?;

        if document.keys.is_empty() {
            return Err(self.unavailable("key set is empty".to_string()));
        }

        let key_set = KeySet::from_keys(document.keys);
        info!(
            jwks_url = %self.jwks_url,
            key_count = key_set.len(),
            "jwks_loaded"
        );

        Ok(key_set)
    }

    fn unavailable(&self, reason: String) -> KeySetError {
        warn!(jwks_url = %self.jwks_url, reason = %reason, "jwks_unavailable");
        KeySetError::Unavailable(reason)
    }
}
