//! Bearer token verification.
//!
//! Tokens are RS256 JWTs issued by the identity provider. A token is accepted
//! only when its `kid` names a key in the resolved set, its signature verifies
//! under that key, and its `aud`, `iss` and `exp` claims match.

use std::sync::Arc;

use jsonwebtoken::{decode, decode_header, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, warn};

use super::jwks::KeySet;

/// Why a token was not accepted.
///
/// Every variant is a 401 to the caller; the distinction only matters in logs.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("MalformedToken: {0}")]
    Malformed(String),

    #[error("KeyNotFound: no signing key with kid '{0}'")]
    KeyNotFound(String),

    #[error("ValidationFailed: {0}")]
    ValidationFailed(String),

    /// Key material or crypto backend fault, not the caller's mistake.
    #[error("InternalFault: {0}")]
    Internal(String),
}

impl TokenError {
    pub fn reason(&self) -> &'static str {
        match self {
            TokenError::Malformed(_) => "MalformedToken",
            TokenError::KeyNotFound(_) => "KeyNotFound",
            TokenError::ValidationFailed(_) => "ValidationFailed",
            TokenError::Internal(_) => "InternalFault",
        }
    }
}

/// Claims kept from a verified token (for logging only).
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    pub iss: String,
    pub exp: u64,
}

/// Verifies bearer tokens against an immutable key set.
pub struct TokenValidator {
    key_set: Arc<KeySet>,
    validation: Validation,
}

impl TokenValidator {
    pub fn new(key_set: Arc<KeySet>, issuer: &str, audience: &str) -> Self {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[audience]);
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "aud", "iss"]);
        validation.leeway = 0;

        Self {
            key_set,
            validation,
        }
    }

    /// Verify `token`, returning its claims or the reason it was refused.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let header = decode_header(token).map_err(|e| TokenError::Malformed(e.to_string()))?;

        let key_id = header
            .kid
            .ok_or_else(|| TokenError::Malformed("header has no kid".to_string()))?;

        let key = self
            .key_set
            .get(&key_id)
            .ok_or_else(|| TokenError::KeyNotFound(key_id.clone()))?;

        if key.key_type != "RSA" {
            return Err(TokenError::Internal(format!(
                "key '{}' has unsupported type '{}'",
                key_id, key.key_type
            )));
        }

        if !key.usage.is_empty() && key.usage != "sig" {
            return Err(TokenError::Internal(format!(
                "key '{}' is published for '{}', not signatures",
                key_id, key.usage
            )));
        }

        let decoding_key = DecodingKey::from_rsa_components(&key.modulus, &key.exponent)
            .map_err(|e| TokenError::Internal(format!("key '{}' is unusable: {}", key_id, e)))?;

        decode::<Claims>(token, &decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidRsaKey(_) | ErrorKind::InvalidKeyFormat | ErrorKind::Crypto(_) => {
                    TokenError::Internal(format!("key '{}': {}", key_id, e))
                }
                _ => TokenError::ValidationFailed(e.to_string()),
            })
    }

    /// Verify `token` and log the outcome.
    pub fn validate(&self, token: &str) -> bool {
        match self.verify(token) {
            Ok(claims) => {
                info!(
                    sub = claims.sub.as_deref().unwrap_or(""),
                    exp = claims.exp,
                    "token_validated"
                );
                true
            }
            Err(e @ TokenError::Internal(_)) => {
                error!(reason = e.reason(), error = %e, "token_validation_fault");
                false
            }
            Err(e) => {
                warn!(reason = e.reason(), error = %e, "token_rejected");
                false
            }
        }
    }
}
