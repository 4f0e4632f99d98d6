//! JWKS (JSON Web Key Set) fetching and caching.
//!
//! Keys are fetched from the provider's JWKS endpoint, cached by `kid` and
//! refreshed once the cache TTL elapses. When a refresh fails, the stale set
//! is used for up to [`MAX_STALE_CACHE_SECONDS`]. A `kid` missing from a
//! fresh set triggers at most one refetch per [`UNKNOWN_KID_REFETCH_SECONDS`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use base64::Engine;
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Default cache TTL in seconds (1 hour).
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 3600;

/// Maximum stale cache age in seconds (24 hours).
pub const MAX_STALE_CACHE_SECONDS: u64 = 86400;

/// Minimum spacing of refetches caused by an unknown `kid`.
pub const UNKNOWN_KID_REFETCH_SECONDS: u64 = 30;

/// Timeout for a single JWKS request.
const FETCH_TIMEOUT_SECONDS: u64 = 10;

/// A single JSON Web Key from a JWKS document.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type (e.g., "RSA")
    pub kty: String,
    /// Key ID, matched against the token header `kid`
    pub kid: Option<String>,
    pub alg: Option<String>,
    /// Key use (e.g., "sig" for signature)
    #[serde(rename = "use")]
    pub key_use: Option<String>,
    /// RSA modulus (base64url encoded)
    pub n: Option<String>,
    /// RSA exponent (base64url encoded)
    pub e: Option<String>,
    /// X.509 certificate chain
    pub x5c: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwksDocument {
    pub keys: Vec<Jwk>,
}

/// Errors from fetching or reading the key set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JwksError {
    /// Failed to fetch JWKS from endpoint.
    Fetch(String),
    /// Failed to parse JWKS response.
    Parse(String),
    /// No usable signing keys in the document.
    NoValidKeys,
    /// Key with specified kid not found.
    KeyNotFound(String),
}

impl fmt::Display for JwksError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch(msg) => write!(f, "Failed to fetch JWKS: {}", msg),
            Self::Parse(msg) => write!(f, "Failed to parse JWKS: {}", msg),
            Self::NoValidKeys => write!(f, "No valid keys found in JWKS"),
            Self::KeyNotFound(kid) => write!(f, "Key not found: {}", kid),
        }
    }
}

impl std::error::Error for JwksError {}

/// Thread-safe, TTL-refreshed set of provider signing keys.
pub struct JwksKeySet {
    jwks_url: String,
    cache_ttl: Duration,
    allow_stale: bool,
    keys: Arc<RwLock<HashMap<String, DecodingKey>>>,
    last_fetch: Arc<RwLock<Option<Instant>>>,
    last_attempt: Arc<RwLock<Option<Instant>>>,
    client: reqwest::Client,
}

impl JwksKeySet {
    pub fn new(jwks_url: impl Into<String>, cache_ttl_seconds: u64, allow_stale: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECONDS))
            .build()?;

        Ok(Self {
            jwks_url: jwks_url.into(),
            cache_ttl: Duration::from_secs(cache_ttl_seconds),
            allow_stale,
            keys: Arc::new(RwLock::new(HashMap::new())),
            last_fetch: Arc::new(RwLock::new(None)),
            last_attempt: Arc::new(RwLock::new(None)),
            client,
        })
    }

    /// Decoding key for `kid`, or any key when the token names none.
    ///
    /// Refreshes when the cache is older than its TTL, or when the key is
    /// unknown and no refresh happened in the last
    /// [`UNKNOWN_KID_REFETCH_SECONDS`].
    pub async fn get_key(&self, kid: Option<&str>) -> Result<DecodingKey, JwksError> {
        let last_fetch = *self.last_fetch.read().await;
        let should_refresh = last_fetch.is_none_or(|t| t.elapsed() > self.cache_ttl);

        if !should_refresh {
            if let Some(key) = self.cached(kid).await {
                return Ok(key);
            }

            let last_attempt = *self.last_attempt.read().await;
            let window = Duration::from_secs(UNKNOWN_KID_REFETCH_SECONDS);
            if last_fetch.into_iter().chain(last_attempt).any(|t| t.elapsed() < window) {
                debug!("Key {:?} not in recently fetched JWKS, not refetching", kid);
                return Err(missing_key(kid));
            }
        }

        match self.fetch_keys().await {
            Ok(()) => self.cached(kid).await.ok_or_else(|| missing_key(kid)),
            Err(e) => {
                if self.allow_stale {
                    let stale_ok = self
                        .last_fetch
                        .read()
                        .await
                        .is_some_and(|t| t.elapsed() < Duration::from_secs(MAX_STALE_CACHE_SECONDS));

                    if stale_ok && let Some(key) = self.cached(kid).await {
                        warn!("JWKS fetch failed, using stale keys: {}", e);
                        return Ok(key);
                    }
                }

                Err(e)
            }
        }
    }

    async fn cached(&self, kid: Option<&str>) -> Option<DecodingKey> {
        let keys = self.keys.read().await;
        match kid {
            Some(k) => keys.get(k).cloned(),
            None => keys.values().next().cloned(),
        }
    }

    /// Fetch keys from the JWKS endpoint and replace the cached set.
    pub async fn fetch_keys(&self) -> Result<(), JwksError> {
        debug!("Fetching JWKS from {}", self.jwks_url);
        *self.last_attempt.write().await = Some(Instant::now());

        let response = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| JwksError::Fetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(JwksError::Fetch(format!(
                "HTTP {} from JWKS endpoint",
                response.status()
            )));
        }

        let document: JwksDocument = response
            .json()
            .await
            .map_err(|e| JwksError::Parse(e.to_string()))?;

        self.load_document(document).await
    }

    /// Replace the cached set with the usable keys of `document`.
    pub async fn load_document(&self, document: JwksDocument) -> Result<(), JwksError> {
        let mut new_keys = HashMap::new();

        for jwk in document.keys {
            if jwk.kty != "RSA" {
                debug!("Skipping non-RSA key: {}", jwk.kty);
                continue;
            }
            if jwk.key_use.as_deref() == Some("enc") {
                continue;
            }

            match jwk_to_decoding_key(&jwk) {
                Ok(key) => {
                    let kid = jwk.kid.clone().unwrap_or_else(|| "default".to_string());
                    new_keys.insert(kid, key);
                }
                Err(e) => warn!("Failed to parse JWK: {}", e),
            }
        }

        if new_keys.is_empty() {
            return Err(JwksError::NoValidKeys);
        }

        let count = new_keys.len();
        *self.keys.write().await = new_keys;
        *self.last_fetch.write().await = Some(Instant::now());

        debug!("Cached {} signing keys", count);
        Ok(())
    }

    pub async fn key_count(&self) -> usize {
        self.keys.read().await.len()
    }
}

fn missing_key(kid: Option<&str>) -> JwksError {
    match kid {
        Some(k) => JwksError::KeyNotFound(k.to_string()),
        None => JwksError::NoValidKeys,
    }
}

/// RSA components are preferred; the first `x5c` entry is only used when
/// `n`/`e` are absent.
fn jwk_to_decoding_key(jwk: &Jwk) -> Result<DecodingKey, JwksError> {
    if let (Some(n), Some(e)) = (&jwk.n, &jwk.e) {
        return DecodingKey::from_rsa_components(n, e)
            .map_err(|err| JwksError::Parse(format!("Invalid RSA components: {}", err)));
    }

    let cert = jwk
        .x5c
        .as_ref()
        .and_then(|chain| chain.first())
        .ok_or_else(|| JwksError::Parse("RSA key has neither n/e nor x5c".to_string()))?;

    // x5c entries are standard (not URL-safe) base64 DER
    let der = base64::engine::general_purpose::STANDARD
        .decode(cert)
        .map_err(|e| JwksError::Parse(format!("Invalid x5c: {}", e)))?;
    Ok(DecodingKey::from_rsa_der(&der))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODULUS: &str = "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw";

    fn document() -> JwksDocument {
        let json = format!(
            r#"{{
                "keys": [
                    {{"kty": "RSA", "kid": "key1", "alg": "RS256", "use": "sig", "n": "{0}", "e": "AQAB"}},
                    {{"kty": "RSA", "kid": "enc1", "use": "enc", "n": "{0}", "e": "AQAB"}},
                    {{"kty": "EC", "kid": "ec1"}}
                ]
            }}"#,
            MODULUS
        );
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_jwk_deserialization() {
        let doc = document();
        assert_eq!(doc.keys.len(), 3);
        assert_eq!(doc.keys[0].kid.as_deref(), Some("key1"));
        assert_eq!(doc.keys[0].key_use.as_deref(), Some("sig"));
        assert!(doc.keys[2].n.is_none());
    }

    #[tokio::test]
    async fn test_load_document_keeps_signing_keys() {
        let set = JwksKeySet::new("https://example.com/jwks.json", 3600, true).unwrap();
        set.load_document(document()).await.unwrap();

        assert_eq!(set.key_count().await, 1);
        assert!(set.get_key(Some("key1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_document_rejected() {
        let set = JwksKeySet::new("https://example.com/jwks.json", 3600, true).unwrap();
        let doc: JwksDocument = serde_json::from_str(r#"{"keys": []}"#).unwrap();
        assert_eq!(set.load_document(doc).await, Err(JwksError::NoValidKeys));
    }

    #[tokio::test]
    async fn test_stale_keys_used_when_fetch_fails() {
        // Nothing listens on port 9; zero TTL forces a refresh attempt
        let set = JwksKeySet::new("http://127.0.0.1:9/jwks.json", 0, true).unwrap();
        set.load_document(document()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(set.get_key(Some("key1")).await.is_ok());

        let strict = JwksKeySet::new("http://127.0.0.1:9/jwks.json", 0, false).unwrap();
        strict.load_document(document()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(matches!(
            strict.get_key(Some("key1")).await,
            Err(JwksError::Fetch(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_kid_does_not_refetch_fresh_set() {
        // A refetch would hit the closed port and surface as Fetch
        let set = JwksKeySet::new("http://127.0.0.1:9/jwks.json", 3600, true).unwrap();
        set.load_document(document()).await.unwrap();

        for _ in 0..3 {
            assert_eq!(
                set.get_key(Some("rotated")).await.err(),
                Some(JwksError::KeyNotFound("rotated".to_string()))
            );
        }
        assert!(set.get_key(Some("key1")).await.is_ok());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            JwksError::Fetch("timeout".to_string()).to_string(),
            "Failed to fetch JWKS: timeout"
        );
        assert_eq!(
            JwksError::KeyNotFound("key123".to_string()).to_string(),
            "Key not found: key123"
        );
    }
}
