//! Shared fixtures for unit and integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::db::{create_connection, DatabaseConfig, Db};
use crate::identity::SurrealIdentityStore;
use crate::provider::{ExternalProvider, ProviderClaims, ProviderError};
use crate::revocation::SurrealRevocationStore;
use crate::types::{ExternalSubject, unix_now};

pub(crate) const MOCK_ISSUER: &str = "https://issuer.test";

/// Provider that accepts a fixed set of tokens and counts calls.
#[derive(Default)]
pub(crate) struct MockProvider {
    tokens: Mutex<HashMap<String, ProviderClaims>>,
    calls: AtomicUsize,
    down: AtomicBool,
}

impl MockProvider {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Accept `token` for `subject`, valid for `ttl_seconds`.
    pub(crate) fn accept(&self, token: &str, subject: &str, ttl_seconds: i64) {
        self.tokens.lock().unwrap().insert(
            token.to_string(),
            ProviderClaims {
                subject_id: ExternalSubject::new(subject),
                expires_at: unix_now() + ttl_seconds,
            },
        );
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExternalProvider for MockProvider {
    fn issuer(&self) -> &str {
        MOCK_ISSUER
    }

    async fn verify(&self, token: &str) -> Result<ProviderClaims, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("connection refused".to_string()));
        }

        let claims = self.tokens.lock().unwrap().get(token).cloned();
        match claims {
            Some(c) if c.expires_at > unix_now() => Ok(c),
            Some(_) => Err(ProviderError::Rejected("expired".to_string())),
            None => Err(ProviderError::Rejected("unknown token".to_string())),
        }
    }
}

pub(crate) async fn memory_db() -> Db {
    create_connection(DatabaseConfig::memory()).await.unwrap()
}

/// Identity store indexed on the default username and federated id fields.
pub(crate) async fn identity_store(db: &Db) -> Arc<SurrealIdentityStore> {
    Arc::new(
        SurrealIdentityStore::new(db.clone(), &["email", "federatedId"])
            .await
            .unwrap(),
    )
}

pub(crate) async fn revocation_store(db: &Db) -> Arc<SurrealRevocationStore> {
    Arc::new(SurrealRevocationStore::new(db.clone()).await.unwrap())
}
