//! SurrealDB-backed identity store.
//!
//! Each identity is one row in the `identity` table. Attributes are kept as
//! a JSON document; the values of the configured unique fields are copied
//! into `keys` so the database can index them and reject duplicates.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use super::{Identity, IdentityStore, LookupOptions, StoreError};
use crate::config::is_field_name;
use crate::db::Db;
use crate::types::IdentityId;

const TABLE: &str = "identity";

/// Attempts for a write that lost an optimistic transaction race.
const MAX_WRITE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentityRow {
    uid: String,
    #[serde(default)]
    keys: BTreeMap<String, String>,
    document: String,
}

impl IdentityRow {
    fn into_identity(self) -> Result<Identity, StoreError> {
        let attributes: Map<String, Value> = serde_json::from_str(&self.document)?;
        Ok(Identity::new(self.uid, attributes))
    }
}

/// Identity store over a SurrealDB connection.
pub struct SurrealIdentityStore {
    db: Db,
    unique_fields: Vec<String>,
}

impl SurrealIdentityStore {
    /// Open the store, defining the table and one unique index per field in
    /// `unique_fields`.
    pub async fn new(db: Db, unique_fields: &[&str]) -> Result<Self> {
        let mut fields: Vec<String> = Vec::new();
        for field in unique_fields {
            if !is_field_name(field) {
                anyhow::bail!("`{}` is not a valid unique field name", field);
            }
            if !fields.iter().any(|f| f == field) {
                fields.push(field.to_string());
            }
        }

        let store = Self {
            db,
            unique_fields: fields,
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        let mut schema = vec![
            format!("DEFINE TABLE IF NOT EXISTS {} SCHEMALESS;", TABLE),
            format!(
                "DEFINE INDEX IF NOT EXISTS identity_uid ON TABLE {} COLUMNS uid UNIQUE;",
                TABLE
            ),
        ];
        for field in &self.unique_fields {
            schema.push(format!(
                "DEFINE INDEX IF NOT EXISTS {} ON TABLE {} COLUMNS keys.{} UNIQUE;",
                index_name(field),
                TABLE,
                field
            ));
        }

        self.db.query(schema.join("\n")).await?.check()?;
        info!(
            "Identity schema ready (unique fields: {})",
            self.unique_fields.join(", ")
        );
        Ok(())
    }

    fn keys_for(&self, attributes: &Map<String, Value>) -> BTreeMap<String, String> {
        self.unique_fields
            .iter()
            .filter_map(|field| {
                let value = match attributes.get(field)? {
                    Value::Null => return None,
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Some((field.clone(), value))
            })
            .collect()
    }

    /// Run a write statement, retrying when the transaction lost a
    /// conflict with a concurrent writer.
    async fn write(&self, statement: &str, vars: Map<String, Value>) -> Result<(), StoreError> {
        let mut attempt = 1;
        loop {
            let result = self
                .db
                .query(statement)
                .bind(vars.clone())
                .await
                .and_then(|res| res.check());

            match result {
                Ok(_) => return Ok(()),
                Err(e) if attempt < MAX_WRITE_ATTEMPTS && is_retryable(&e) => {
                    debug!("Retrying identity write after conflict (attempt {})", attempt);
                    attempt += 1;
                }
                Err(e) => return Err(self.classify(e)),
            }
        }
    }

    /// Map a write failure to `DuplicateKey` when a unique index rejected it.
    fn classify(&self, err: surrealdb::Error) -> StoreError {
        let message = err.to_string();
        if message.contains("already contains") {
            for field in &self.unique_fields {
                if message.contains(&format!("`{}`", index_name(field))) {
                    return StoreError::DuplicateKey {
                        field: field.clone(),
                    };
                }
            }
        }
        StoreError::Backend(err.into())
    }

    async fn row_by_uid(&self, uid: &str) -> Result<Option<IdentityRow>, StoreError> {
        let mut res = self
            .db
            .query("SELECT uid, keys, document FROM identity WHERE uid = $uid LIMIT 1")
            .bind(("uid", uid.to_string()))
            .await?;

        let rows: Vec<IdentityRow> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    /// Apply populate then projection.
    async fn resolve(&self, row: IdentityRow, lookup: &LookupOptions) -> Result<Identity, StoreError> {
        let mut identity = row.into_identity()?;

        for field in &lookup.populate {
            let Some(value) = identity.attributes.get(field).cloned() else {
                continue;
            };
            let expanded = match value {
                Value::String(uid) => self.expand_reference(&uid).await?,
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        match item {
                            Value::String(uid) => out.push(self.expand_reference(&uid).await?),
                            other => out.push(other),
                        }
                    }
                    Value::Array(out)
                }
                other => other,
            };
            identity.attributes.insert(field.clone(), expanded);
        }

        Ok(lookup.project(identity))
    }

    /// Referenced identity as JSON, or the raw id when it no longer exists.
    async fn expand_reference(&self, uid: &str) -> Result<Value, StoreError> {
        match self.row_by_uid(uid).await? {
            Some(row) => Ok(row.into_identity()?.to_json()),
            None => {
                debug!("Populate reference {} not found", uid);
                Ok(Value::String(uid.to_string()))
            }
        }
    }
}

fn is_retryable(err: &surrealdb::Error) -> bool {
    err.to_string().contains("can be retried")
}

fn index_name(field: &str) -> String {
    format!("identity_key_{}", field)
}

#[async_trait]
impl IdentityStore for SurrealIdentityStore {
    async fn create(&self, mut attributes: Map<String, Value>) -> Result<Identity, StoreError> {
        attributes.remove("id");
        let uid = Uuid::new_v4().to_string();
        let row = IdentityRow {
            uid: uid.clone(),
            keys: self.keys_for(&attributes),
            document: serde_json::to_string(&attributes)?,
        };

        let mut vars = Map::new();
        vars.insert("row".to_string(), serde_json::to_value(&row)?);
        self.write("CREATE identity CONTENT $row RETURN NONE", vars)
            .await?;

        debug!("Created identity {}", uid);
        Ok(Identity::new(uid, attributes))
    }

    async fn find_by_unique_field(
        &self,
        field: &str,
        value: &str,
        lookup: &LookupOptions,
    ) -> Result<Option<Identity>, StoreError> {
        if !self.unique_fields.iter().any(|f| f == field) {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "field `{}` is not a unique identity field",
                field
            )));
        }

        let query = format!(
            "SELECT uid, keys, document FROM identity WHERE keys.{} = $value LIMIT 1",
            field
        );
        let mut res = self
            .db
            .query(query)
            .bind(("value", value.to_string()))
            .await?;

        let rows: Vec<IdentityRow> = res.take(0)?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(self.resolve(row, lookup).await?)),
            None => Ok(None),
        }
    }

    async fn find_by_id(
        &self,
        id: &IdentityId,
        lookup: &LookupOptions,
    ) -> Result<Option<Identity>, StoreError> {
        match self.row_by_uid(id.as_str()).await? {
            Some(row) => Ok(Some(self.resolve(row, lookup).await?)),
            None => Ok(None),
        }
    }

    async fn update_by_id(
        &self,
        id: &IdentityId,
        patch: Map<String, Value>,
    ) -> Result<Option<Identity>, StoreError> {
        let Some(row) = self.row_by_uid(id.as_str()).await? else {
            return Ok(None);
        };

        let mut identity = row.into_identity()?;
        for (key, value) in patch {
            if key == "id" {
                continue;
            }
            if value.is_null() {
                identity.attributes.remove(&key);
            } else {
                identity.attributes.insert(key, value);
            }
        }

        let keys = self.keys_for(&identity.attributes);
        let document = serde_json::to_string(&identity.attributes)?;

        let mut vars = Map::new();
        vars.insert("keys".to_string(), serde_json::to_value(&keys)?);
        vars.insert("document".to_string(), Value::String(document));
        vars.insert("uid".to_string(), Value::String(id.to_string()));
        self.write(
            "UPDATE identity SET keys = $keys, document = $document WHERE uid = $uid RETURN NONE",
            vars,
        )
        .await?;

        Ok(Some(identity))
    }
}
