//! Identity records and the store contract the engine depends on.

pub mod surreal;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::IdentityId;

pub use surreal::SurrealIdentityStore;

/// A stored identity: a store-minted id plus application attributes.
///
/// Serializes flat, with the id under `"id"` next to the attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Identity {
    pub fn new(id: impl Into<IdentityId>, mut attributes: Map<String, Value>) -> Self {
        attributes.remove("id");
        Self {
            id: id.into(),
            attributes,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.attributes.get(field)
    }

    /// String value of an attribute, if present and a string.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.attributes.get(field).and_then(Value::as_str)
    }

    /// Drop an attribute, e.g. the credential record before handing the
    /// identity to a caller.
    pub fn without(mut self, field: &str) -> Self {
        self.attributes.remove(field);
        self
    }

    pub fn to_json(&self) -> Value {
        let mut map = self.attributes.clone();
        map.insert("id".to_string(), Value::String(self.id.to_string()));
        Value::Object(map)
    }
}

/// Lookup directives forwarded to the identity store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LookupOptions {
    /// Attributes to keep in returned identities (all when `None`)
    #[serde(default)]
    pub projection: Option<Vec<String>>,
    /// Attributes holding identity ids to expand into the referenced identity
    #[serde(default)]
    pub populate: Vec<String>,
}

impl LookupOptions {
    /// Same directives, with `field` guaranteed to survive projection.
    pub fn including(&self, field: &str) -> Self {
        let mut options = self.clone();
        if let Some(projection) = options.projection.as_mut() {
            if !projection.iter().any(|f| f == field) {
                projection.push(field.to_string());
            }
        }
        options
    }

    /// Keep only the projected attributes.
    pub fn project(&self, identity: Identity) -> Identity {
        match &self.projection {
            None => identity,
            Some(fields) => {
                let Identity { id, attributes } = identity;
                let attributes = attributes
                    .into_iter()
                    .filter(|(k, _)| fields.iter().any(|f| f == k))
                    .collect();
                Identity { id, attributes }
            }
        }
    }

    /// Drop `field` from the identity and from every identity that
    /// `populate` expanded into it.
    pub fn redact(&self, identity: Identity, field: &str) -> Identity {
        let mut identity = identity.without(field);
        for name in &self.populate {
            match identity.attributes.get_mut(name) {
                Some(Value::Object(referenced)) => {
                    referenced.remove(field);
                }
                Some(Value::Array(items)) => {
                    for item in items.iter_mut() {
                        if let Value::Object(referenced) = item {
                            referenced.remove(field);
                        }
                    }
                }
                _ => {}
            }
        }
        identity
    }
}

/// Identity store failures.
#[derive(Debug)]
pub enum StoreError {
    /// A unique field already holds this value
    DuplicateKey { field: String },
    /// Any other backend failure
    Backend(anyhow::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateKey { field } => write!(f, "Duplicate value for unique field `{}`", field),
            Self::Backend(e) => write!(f, "Store backend error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<anyhow::Error> for StoreError {
    fn from(e: anyhow::Error) -> Self {
        Self::Backend(e)
    }
}

impl From<surrealdb::Error> for StoreError {
    fn from(e: surrealdb::Error) -> Self {
        Self::Backend(e.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Backend(e.into())
    }
}

/// Persistence for identities.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Persist a new identity and return it with its minted id.
    async fn create(&self, attributes: Map<String, Value>) -> Result<Identity, StoreError>;

    /// Find the identity whose unique `field` equals `value`.
    async fn find_by_unique_field(
        &self,
        field: &str,
        value: &str,
        lookup: &LookupOptions,
    ) -> Result<Option<Identity>, StoreError>;

    async fn find_by_id(
        &self,
        id: &IdentityId,
        lookup: &LookupOptions,
    ) -> Result<Option<Identity>, StoreError>;

    /// Merge `patch` into the identity. `null` values remove attributes.
    /// Returns `None` when no identity has this id.
    async fn update_by_id(
        &self,
        id: &IdentityId,
        patch: Map<String, Value>,
    ) -> Result<Option<Identity>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Identity {
        let attrs = json!({"email": "a@x.com", "password": "salt$key", "name": "A"});
        Identity::new("id-1", attrs.as_object().unwrap().clone())
    }

    #[test]
    fn test_identity_serializes_flat() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["id"], "id-1");
        assert_eq!(value["email"], "a@x.com");
        assert_eq!(value, sample().to_json());

        let back: Identity = serde_json::from_value(value).unwrap();
        assert_eq!(back, sample());
        assert!(back.get("id").is_none());
    }

    #[test]
    fn test_without_drops_field() {
        let identity = sample().without("password");
        assert!(identity.get("password").is_none());
        assert_eq!(identity.get_str("email"), Some("a@x.com"));
    }

    #[test]
    fn test_projection() {
        let lookup = LookupOptions {
            projection: Some(vec!["name".to_string()]),
            populate: vec![],
        };
        let projected = lookup.project(sample());
        assert_eq!(projected.id.as_str(), "id-1");
        assert_eq!(projected.attributes.len(), 1);
        assert_eq!(projected.get_str("name"), Some("A"));

        let widened = lookup.including("password").project(sample());
        assert_eq!(widened.get_str("password"), Some("salt$key"));
        assert!(widened.get("email").is_none());

        assert_eq!(LookupOptions::default().project(sample()), sample());
    }

    #[test]
    fn test_redact_reaches_populated_references() {
        let attrs = json!({
            "email": "a@x.com",
            "password": "salt$key",
            "manager": {"id": "id-2", "email": "boss@x.com", "password": "salt$boss"},
            "reports": [{"id": "id-3", "password": "salt$r"}, "id-4"],
            "team": {"password": "not-populated"},
        });
        let identity = Identity::new("id-1", attrs.as_object().unwrap().clone());
        let lookup = LookupOptions {
            projection: None,
            populate: vec!["manager".to_string(), "reports".to_string()],
        };

        let redacted = lookup.redact(identity, "password");
        assert!(redacted.get("password").is_none());
        assert_eq!(redacted.get("manager").unwrap(), &json!({"id": "id-2", "email": "boss@x.com"}));
        assert_eq!(redacted.get("reports").unwrap(), &json!([{"id": "id-3"}, "id-4"]));
        assert_eq!(redacted.get("team").unwrap(), &json!({"password": "not-populated"}));
    }
}
