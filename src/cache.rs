//! Short-lived cache of verified identities, keyed by bearer token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::identity::StoreError;

/// Key-value cache with per-entry TTL.
#[async_trait]
pub trait VerificationCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct CachedValue {
    value: String,
    expires_at: Instant,
}

/// In-process cache. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryVerificationCache {
    entries: Arc<RwLock<HashMap<String, CachedValue>>>,
}

impl MemoryVerificationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, cached| cached.expires_at > now);
        before - entries.len()
    }
}

#[async_trait]
impl VerificationCache for MemoryVerificationCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(cached) if cached.expires_at > Instant::now() => {
                    return Ok(Some(cached.value.clone()));
                }
                Some(_) => {}
            }
        }

        // Expired: evict unless a writer refreshed it meanwhile
        let mut entries = self.entries.write().await;
        if entries
            .get(key)
            .is_some_and(|cached| cached.expires_at <= Instant::now())
        {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        if ttl.is_zero() {
            return Ok(());
        }
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            CachedValue {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryVerificationCache::new();
        cache
            .set("k", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(cache.len().await, 1);

        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        // Deleting twice is fine
        cache.delete("k").await.unwrap();
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = MemoryVerificationCache::new();
        cache
            .set("short", "v".to_string(), Duration::from_millis(50))
            .await
            .unwrap();
        cache
            .set("long", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(cache.get("short").await.unwrap(), None);
        assert_eq!(cache.len().await, 1);
        assert!(cache.get("long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let cache = MemoryVerificationCache::new();
        cache
            .set("a", "1".to_string(), Duration::from_millis(20))
            .await
            .unwrap();
        cache
            .set("b", "2".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_is_not_stored() {
        let cache = MemoryVerificationCache::new();
        cache.set("k", "v".to_string(), Duration::ZERO).await.unwrap();
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let cache = MemoryVerificationCache::new();
        let other = cache.clone();
        cache
            .set("k", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(other.get("k").await.unwrap(), Some("v".to_string()));
    }
}
