//! SurrealDB-backed banlist.
//!
//! One `banlist` record per key, with the record id derived from the key so
//! that two concurrent inserts for the same key cannot both succeed.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use surrealdb::RecordId;
use tracing::{debug, info};

use super::{BanEntry, BanKey, RevocationStore};
use crate::db::Db;
use crate::identity::StoreError;
use crate::types::unix_now;

const TABLE: &str = "banlist";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BanRow {
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_hash: Option<String>,
    created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
}

impl BanRow {
    fn from_entry(entry: &BanEntry) -> Self {
        let (subject, token_hash) = match &entry.key {
            BanKey::Token(token) => (None, Some(super::token_digest(token))),
            BanKey::Subject(id) => (Some(id.to_string()), None),
        };
        Self {
            kind: entry.key.kind().to_string(),
            subject,
            token_hash,
            created_at: entry.created_at,
            expires_at: entry.expires_at,
        }
    }

    fn into_entry(self, key: BanKey) -> BanEntry {
        BanEntry {
            key,
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

pub struct SurrealRevocationStore {
    db: Db,
}

impl SurrealRevocationStore {
    pub async fn new(db: Db) -> Result<Self> {
        db.query(format!("DEFINE TABLE IF NOT EXISTS {} SCHEMALESS;", TABLE))
            .await?
            .check()?;
        Ok(Self { db })
    }

    fn record_id(key: &BanKey) -> RecordId {
        RecordId::from_table_key(TABLE, key.storage_key())
    }

    async fn row(&self, key: &BanKey) -> Result<Option<BanRow>, StoreError> {
        let mut res = self
            .db
            .query("SELECT kind, subject, token_hash, created_at, expires_at FROM $id")
            .bind(("id", Self::record_id(key)))
            .await?;

        let rows: Vec<BanRow> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    /// Delete every entry whose expiry has passed. Returns how many were
    /// removed.
    pub async fn remove_expired(&self) -> Result<usize, StoreError> {
        let mut res = self
            .db
            .query("DELETE banlist WHERE expires_at != NONE AND expires_at <= $now RETURN BEFORE")
            .bind(("now", unix_now()))
            .await?;

        let removed: Vec<BanRow> = res.take(0)?;
        if !removed.is_empty() {
            info!("Removed {} expired ban entries", removed.len());
        }
        Ok(removed.len())
    }
}

#[async_trait]
impl RevocationStore for SurrealRevocationStore {
    async fn insert(&self, entry: BanEntry) -> Result<bool, StoreError> {
        if let Some(existing) = self.row(&entry.key).await? {
            if existing.clone().into_entry(entry.key.clone()).is_active(unix_now()) {
                debug!("Ban for {} already active", entry.key.kind());
                return Ok(false);
            }
            // Lapsed entry: replace it
            self.delete(&entry.key).await?;
        }

        let result = self
            .db
            .query("CREATE $id CONTENT $row RETURN NONE")
            .bind(("id", Self::record_id(&entry.key)))
            .bind(("row", BanRow::from_entry(&entry)))
            .await
            .and_then(|res| res.check());

        match result {
            Ok(_) => {
                debug!("Inserted {} ban", entry.key.kind());
                Ok(true)
            }
            Err(e) if e.to_string().contains("already exists") => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_active(&self, key: &BanKey) -> Result<Option<BanEntry>, StoreError> {
        let Some(row) = self.row(key).await? else {
            return Ok(None);
        };

        let entry = row.into_entry(key.clone());
        if entry.is_active(unix_now()) {
            Ok(Some(entry))
        } else {
            Ok(None)
        }
    }

    async fn delete(&self, key: &BanKey) -> Result<bool, StoreError> {
        let mut res = self
            .db
            .query("DELETE $id RETURN BEFORE")
            .bind(("id", Self::record_id(key)))
            .await?;

        let removed: Vec<BanRow> = res.take(0)?;
        Ok(!removed.is_empty())
    }
}
