//! Signing and verification of locally issued identity tokens.

use std::fmt;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SecretKey;
use crate::error::{AuthError, AuthResult};
use crate::types::{IdentityId, unix_now};

/// Claims carried by an identity token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (identity id)
    pub sub: String,
    /// Issuer
    pub iss: String,
    /// Deployment domain the token was issued for
    pub domain: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

impl Claims {
    pub fn subject(&self) -> IdentityId {
        IdentityId::new(self.sub.clone())
    }
}

#[derive(Deserialize)]
struct ExpiryOnly {
    exp: Option<i64>,
}

/// `exp` of a JWT read without checking signature or claims. Only for
/// bounding bookkeeping about a token, never for trusting it.
pub fn unverified_expiry(token: &str) -> Option<i64> {
    jsonwebtoken::dangerous::insecure_decode::<ExpiryOnly>(token)
        .ok()
        .and_then(|data| data.claims.exp)
}

/// Why a token failed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Not a well-formed token
    Malformed(String),
    /// Signature does not match the configured secret
    BadSignature,
    /// `exp` is in the past
    Expired,
    /// `iss` does not match
    WrongIssuer,
    /// `domain` does not match
    WrongDomain,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "Malformed token: {}", msg),
            Self::BadSignature => write!(f, "Token signature verification failed"),
            Self::Expired => write!(f, "Token expired"),
            Self::WrongIssuer => write!(f, "Token issuer mismatch"),
            Self::WrongDomain => write!(f, "Token domain mismatch"),
        }
    }
}

impl std::error::Error for TokenError {}

/// HS256 codec bound to one secret, issuer and domain.
#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    domain: String,
}

impl TokenCodec {
    pub fn new(secret: &SecretKey, issuer: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.into(),
            domain: domain.into(),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Claims for `subject` expiring at `expires_at`, stamped with this
    /// codec's issuer and domain.
    pub fn claims_for(&self, subject: &IdentityId, expires_at: i64) -> Claims {
        Claims {
            sub: subject.to_string(),
            iss: self.issuer.clone(),
            domain: self.domain.clone(),
            exp: expires_at,
            iat: Some(unix_now()),
        }
    }

    /// Sign a claim set. Issuer and domain are always overwritten with the
    /// codec's own values.
    pub fn sign(&self, claims: &Claims) -> AuthResult<String> {
        let claims = Claims {
            iss: self.issuer.clone(),
            domain: self.domain.clone(),
            ..claims.clone()
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::internal("Failed to sign token", e))
    }

    /// Verify signature, issuer, domain and expiry.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "sub", "iss"]);

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature => TokenError::BadSignature,
                ErrorKind::InvalidIssuer => TokenError::WrongIssuer,
                _ => TokenError::Malformed(e.to_string()),
            }
        })?;
        let claims = data.claims;

        // jsonwebtoken accepts exp == now; a token is only valid strictly before expiry
        if claims.exp <= unix_now() {
            return Err(TokenError::Expired);
        }

        if claims.domain != self.domain {
            return Err(TokenError::WrongDomain);
        }

        debug!("Token verified for subject: {}", claims.sub);
        Ok(claims)
    }
}
