//! Banlist of revoked tokens and subjects.

pub mod surreal;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::identity::StoreError;
use crate::types::{IdentityId, unix_now};

pub use surreal::SurrealRevocationStore;

/// What a ban entry is keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BanKey {
    /// A raw bearer token
    Token(String),
    /// Every token of an identity
    Subject(IdentityId),
}

impl BanKey {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::Subject(_) => "subject",
        }
    }

    /// Storage key. Raw tokens are never persisted, only their digest.
    pub fn storage_key(&self) -> String {
        match self {
            Self::Token(token) => format!("token_{}", token_digest(token)),
            Self::Subject(id) => format!("subject_{}", id),
        }
    }
}

/// Hex SHA-256 of a bearer token.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEntry {
    pub key: BanKey,
    pub created_at: i64,
    /// Unix time after which the entry no longer applies
    pub expires_at: Option<i64>,
}

impl BanEntry {
    pub fn new(key: BanKey, expires_at: Option<i64>) -> Self {
        Self {
            key,
            created_at: unix_now(),
            expires_at,
        }
    }

    pub fn permanent(key: BanKey) -> Self {
        Self::new(key, None)
    }

    pub fn is_active(&self, now: i64) -> bool {
        self.expires_at.is_none_or(|exp| now < exp)
    }
}

/// Persistence for ban entries.
#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Record a ban. Returns `false` when an active entry for the key
    /// already exists, in which case nothing is written.
    async fn insert(&self, entry: BanEntry) -> Result<bool, StoreError>;

    /// The active entry for `key`, if any.
    async fn find_active(&self, key: &BanKey) -> Result<Option<BanEntry>, StoreError>;

    /// Remove the entry for `key`. Returns whether one existed.
    async fn delete(&self, key: &BanKey) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_hides_token() {
        let key = BanKey::Token("eyJhbGciOi.secret.part".to_string());
        let stored = key.storage_key();
        assert!(stored.starts_with("token_"));
        assert!(!stored.contains("secret"));
        assert_eq!(stored.len(), "token_".len() + 64);

        let subject = BanKey::Subject(IdentityId::new("abc"));
        assert_eq!(subject.storage_key(), "subject_abc");
        assert_eq!(subject.kind(), "subject");
    }

    #[test]
    fn test_entry_expiry() {
        let now = unix_now();
        let key = BanKey::Subject(IdentityId::new("abc"));

        assert!(BanEntry::permanent(key.clone()).is_active(now + 1_000_000));

        let entry = BanEntry::new(key, Some(now + 10));
        assert!(entry.is_active(now));
        assert!(!entry.is_active(now + 10));
    }
}
