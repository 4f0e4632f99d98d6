//! Bearer tokens verified by an external identity provider.
//!
//! Verified identities are cached per token for at most the token's
//! remaining lifetime, so repeated requests with the same token skip the
//! provider round trip.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::VerificationCache;
use crate::config::AuthConfig;
use crate::error::{AuthError, AuthResult};
use crate::identity::{Identity, IdentityStore, LookupOptions};
use crate::provider::{ExternalProvider, ProviderClaims, ProviderError};
use crate::token::Claims;
use crate::types::unix_now;

pub struct FederatedStrategy {
    provider: Arc<dyn ExternalProvider>,
    store: Arc<dyn IdentityStore>,
    cache: Arc<dyn VerificationCache>,
    federated_id_field: String,
    password_field: String,
    cache_prefix: String,
    max_cache_ttl: Option<Duration>,
    domain: String,
    lookup: LookupOptions,
}

impl FederatedStrategy {
    pub fn new(
        config: &AuthConfig,
        store: Arc<dyn IdentityStore>,
        provider: Arc<dyn ExternalProvider>,
        cache: Arc<dyn VerificationCache>,
    ) -> Self {
        Self {
            provider,
            store,
            cache,
            federated_id_field: config.federated_id_field.clone(),
            password_field: config.password_field.clone(),
            cache_prefix: config.cache_prefix.clone(),
            max_cache_ttl: config.max_cache_ttl(),
            domain: config.token_domain.clone(),
            lookup: config.lookup.clone(),
        }
    }

    fn cache_key(&self, token: &str) -> String {
        format!("{}:{}", self.cache_prefix, token)
    }

    /// Ask the provider about `token`. Rejection is `None`; an unreachable
    /// provider is an internal error.
    pub async fn verify_external(&self, token: &str) -> AuthResult<Option<ProviderClaims>> {
        match self.provider.verify(token).await {
            Ok(claims) => Ok(Some(claims)),
            Err(ProviderError::Rejected(reason)) => {
                debug!("Provider rejected token: {}", reason);
                Ok(None)
            }
            Err(e) => Err(AuthError::internal("Provider verification failed", e)),
        }
    }

    /// Verify with the provider and map the subject to a local identity.
    ///
    /// A verified token with no local identity is
    /// [`AuthError::NewFederatedIdentity`].
    pub async fn login(&self, token: &str) -> AuthResult<Option<Identity>> {
        let Some(claims) = self.verify_external(token).await? else {
            return Ok(None);
        };

        let found = self
            .store
            .find_by_unique_field(&self.federated_id_field, claims.subject_id.as_str(), &self.lookup)
            .await
            .map_err(|e| AuthError::internal("Identity lookup failed", e))?
            .ok_or(AuthError::NewFederatedIdentity)?;
        let identity = self.lookup.redact(found, &self.password_field);

        self.remember(token, &identity, claims.expires_at).await;
        Ok(Some(identity))
    }

    async fn remember(&self, token: &str, identity: &Identity, expires_at: i64) {
        let remaining = Duration::from_secs((expires_at - unix_now()).max(0) as u64);
        let ttl = match self.max_cache_ttl {
            Some(max) => remaining.min(max),
            None => remaining,
        };
        if ttl.is_zero() {
            return;
        }

        let value = match serde_json::to_string(identity) {
            Ok(v) => v,
            Err(e) => {
                warn!("Could not serialize identity for cache: {}", e);
                return;
            }
        };

        if let Err(e) = self.cache.set(&self.cache_key(token), value, ttl).await {
            warn!("Verification cache write failed: {}", e);
        }
    }

    /// Provider claims reshaped as engine claims. `sub` is the provider's
    /// subject id, not the local identity id.
    pub async fn verify_token(&self, token: &str) -> AuthResult<Option<Claims>> {
        Ok(self.verify_external(token).await?.map(|claims| Claims {
            sub: claims.subject_id.into_inner(),
            iss: self.provider.issuer().to_string(),
            domain: self.domain.clone(),
            exp: claims.expires_at,
            iat: None,
        }))
    }

    /// Cached identity for `token`, or a full login on a miss.
    pub async fn middleware(&self, token: &str) -> AuthResult<Option<Identity>> {
        match self.cache.get(&self.cache_key(token)).await {
            Ok(Some(cached)) => match serde_json::from_str::<Identity>(&cached) {
                Ok(identity) => {
                    debug!("Verification cache hit for identity {}", identity.id);
                    return Ok(Some(identity));
                }
                Err(e) => warn!("Discarding unreadable cache entry: {}", e),
            },
            Ok(None) => {}
            Err(e) => warn!("Verification cache read failed, treating as miss: {}", e),
        }

        match self.login(token).await {
            Err(AuthError::NewFederatedIdentity) => Ok(None),
            other => other,
        }
    }

    /// Evict the cached verification for `token`.
    pub async fn logout(&self, token: &str) -> bool {
        if let Err(e) = self.cache.delete(&self.cache_key(token)).await {
            warn!("Verification cache delete failed: {}", e);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryVerificationCache;
    use crate::config::FederatedConfig;
    use crate::identity::StoreError;
    use crate::testing::{MOCK_ISSUER, MockProvider, identity_store, memory_db};
    use async_trait::async_trait;
    use serde_json::json;

    struct BrokenCache;

    #[async_trait]
    impl VerificationCache for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Backend(anyhow::anyhow!("cache down")))
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), StoreError> {
            Err(StoreError::Backend(anyhow::anyhow!("cache down")))
        }

        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend(anyhow::anyhow!("cache down")))
        }
    }

    fn config() -> AuthConfig {
        AuthConfig::federated(
            "fed-secret",
            FederatedConfig::jwks("http://127.0.0.1:9/jwks.json", MOCK_ISSUER, None),
        )
    }

    async fn setup(
        config: &AuthConfig,
        cache: Arc<dyn VerificationCache>,
    ) -> (FederatedStrategy, Arc<MockProvider>) {
        let db = memory_db().await;
        let store = identity_store(&db).await;
        let attrs = json!({"email": "f@x.com", "federatedId": "ext-1", "name": "F"});
        store.create(attrs.as_object().unwrap().clone()).await.unwrap();

        let provider = MockProvider::new();
        let strategy = FederatedStrategy::new(config, store, provider.clone(), cache);
        (strategy, provider)
    }

    #[tokio::test]
    async fn test_login_maps_subject() {
        let (strategy, provider) = setup(&config(), Arc::new(MemoryVerificationCache::new())).await;
        provider.accept("tok-1", "ext-1", 3600);

        let identity = strategy.login("tok-1").await.unwrap().unwrap();
        assert_eq!(identity.get_str("email"), Some("f@x.com"));

        assert!(strategy.login("tok-unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_login_without_local_identity() {
        let (strategy, provider) = setup(&config(), Arc::new(MemoryVerificationCache::new())).await;
        provider.accept("tok-new", "ext-unmapped", 3600);

        assert_eq!(
            strategy.login("tok-new").await,
            Err(AuthError::NewFederatedIdentity)
        );
        assert!(strategy.middleware("tok-new").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_provider_outage_is_internal() {
        let (strategy, provider) = setup(&config(), Arc::new(MemoryVerificationCache::new())).await;
        provider.set_down(true);
        assert_eq!(strategy.login("tok-1").await, Err(AuthError::Internal));
    }

    #[tokio::test]
    async fn test_middleware_uses_cache() {
        let cache = Arc::new(MemoryVerificationCache::new());
        let (strategy, provider) = setup(&config(), cache.clone()).await;
        provider.accept("tok-1", "ext-1", 3600);

        let first = strategy.middleware("tok-1").await.unwrap().unwrap();
        let second = strategy.middleware("tok-1").await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.calls(), 1);
        assert!(cache.get("authgate:token:tok-1").await.unwrap().is_some());

        assert!(strategy.logout("tok-1").await);
        strategy.middleware("tok-1").await.unwrap().unwrap();
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_cache_ttl_is_capped() {
        let mut config = config();
        config.max_cache_ttl_seconds = Some(1);
        let (strategy, provider) = setup(&config, Arc::new(MemoryVerificationCache::new())).await;
        provider.accept("tok-1", "ext-1", 3600);

        strategy.middleware("tok-1").await.unwrap().unwrap();
        strategy.middleware("tok-1").await.unwrap().unwrap();
        assert_eq!(provider.calls(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        strategy.middleware("tok-1").await.unwrap().unwrap();
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_broken_cache_is_only_slower() {
        let (strategy, provider) = setup(&config(), Arc::new(BrokenCache)).await;
        provider.accept("tok-1", "ext-1", 3600);

        assert!(strategy.middleware("tok-1").await.unwrap().is_some());
        assert!(strategy.middleware("tok-1").await.unwrap().is_some());
        assert_eq!(provider.calls(), 2);
        assert!(strategy.logout("tok-1").await);
    }

    #[tokio::test]
    async fn test_verify_token_claims() {
        let (strategy, provider) = setup(&config(), Arc::new(MemoryVerificationCache::new())).await;
        provider.accept("tok-1", "ext-1", 3600);

        let claims = strategy.verify_token("tok-1").await.unwrap().unwrap();
        assert_eq!(claims.sub, "ext-1");
        assert_eq!(claims.iss, MOCK_ISSUER);
        assert_eq!(claims.domain, "localhost");
        assert!(strategy.verify_token("nope").await.unwrap().is_none());
    }
}
