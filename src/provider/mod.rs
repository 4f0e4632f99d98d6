//! External identity providers for the federated strategy.

pub mod jwks;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, Validation, decode, decode_header};
use serde::Deserialize;
use tracing::debug;

use crate::config::FederatedConfig;
use crate::types::ExternalSubject;

use jwks::{JwksError, JwksKeySet};

/// What a provider asserts about a token it accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderClaims {
    pub subject_id: ExternalSubject,
    /// Unix expiry of the external token
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The token is not valid for this provider
    Rejected(String),
    /// The provider could not be reached or answered garbage
    Unavailable(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(msg) => write!(f, "Token rejected by provider: {}", msg),
            Self::Unavailable(msg) => write!(f, "Identity provider unavailable: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Verifies bearer tokens issued by a third party.
#[async_trait]
pub trait ExternalProvider: Send + Sync {
    /// `iss` value of tokens this provider accepts.
    fn issuer(&self) -> &str;

    async fn verify(&self, token: &str) -> Result<ProviderClaims, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct ProviderTokenClaims {
    #[serde(default)]
    sub: Option<String>,
    /// Firebase duplicates the subject here
    #[serde(default)]
    user_id: Option<String>,
    exp: i64,
}

/// RS256 tokens checked against a JWKS endpoint (Firebase and any other
/// OIDC-style issuer).
pub struct JwksProvider {
    keys: JwksKeySet,
    issuer: String,
    audience: Option<String>,
}

impl JwksProvider {
    pub fn new(config: &FederatedConfig) -> Result<Self> {
        Ok(Self {
            keys: JwksKeySet::new(
                config.jwks_url.clone(),
                config.jwks_cache_seconds,
                config.allow_stale_jwks,
            )?,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
        })
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.issuer]);
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        validation
    }
}

#[async_trait]
impl ExternalProvider for JwksProvider {
    fn issuer(&self) -> &str {
        &self.issuer
    }

    async fn verify(&self, token: &str) -> Result<ProviderClaims, ProviderError> {
        let header = decode_header(token)
            .map_err(|e| ProviderError::Rejected(format!("Invalid JWT header: {}", e)))?;
        if header.alg != Algorithm::RS256 {
            return Err(ProviderError::Rejected(format!(
                "Unexpected algorithm {:?}",
                header.alg
            )));
        }

        let key = self
            .keys
            .get_key(header.kid.as_deref())
            .await
            .map_err(|e| match e {
                JwksError::KeyNotFound(_) => ProviderError::Rejected(e.to_string()),
                other => ProviderError::Unavailable(other.to_string()),
            })?;

        let data = decode::<ProviderTokenClaims>(token, &key, &self.validation())
            .map_err(|e| ProviderError::Rejected(format!("Signature verification failed: {}", e)))?;
        let claims = data.claims;

        let subject = claims
            .sub
            .filter(|s| !s.is_empty())
            .or(claims.user_id.filter(|s| !s.is_empty()))
            .ok_or_else(|| ProviderError::Rejected("Token carries no subject".to_string()))?;

        debug!("Provider token verified for subject: {}", subject);
        Ok(ProviderClaims {
            subject_id: ExternalSubject::new(subject),
            expires_at: claims.exp,
        })
    }
}
