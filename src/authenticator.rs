//! The engine's public contract: registration, login, per-request gating
//! and revocation on top of the active strategy.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::cache::{MemoryVerificationCache, VerificationCache};
use crate::config::{AuthConfig, StrategyKind};
use crate::db::Db;
use crate::error::{AuthError, AuthResult};
use crate::identity::{Identity, IdentityStore, StoreError, SurrealIdentityStore};
use crate::provider::{ExternalProvider, JwksProvider};
use crate::revocation::{BanEntry, BanKey, RevocationStore, SurrealRevocationStore};
use crate::strategy::{Credentials, FederatedStrategy, LocalStrategy, Strategy};
use crate::token::{Claims, unverified_expiry};
use crate::types::{IdentityId, strip_bearer, unix_now};

/// A successful login.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub identity: Identity,
    /// Bearer token to present on later requests
    pub token: String,
}

/// Outcome of gating one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Gate {
    Authenticated(Identity),
    Unauthenticated,
    Forbidden,
}

impl Gate {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }

    /// The identity, or the matching [`AuthError`].
    pub fn into_result(self) -> AuthResult<Identity> {
        match self {
            Self::Authenticated(identity) => Ok(identity),
            Self::Unauthenticated => Err(AuthError::Unauthorized),
            Self::Forbidden => Err(AuthError::Forbidden),
        }
    }
}

pub struct Authenticator {
    strategy: Strategy,
    identities: Arc<dyn IdentityStore>,
    revocations: Arc<dyn RevocationStore>,
    username_field: String,
    password_field: String,
    federated_id_field: String,
}

impl Authenticator {
    /// Engine running the local strategy.
    pub fn local(
        config: &AuthConfig,
        identities: Arc<dyn IdentityStore>,
        revocations: Arc<dyn RevocationStore>,
    ) -> AuthResult<Self> {
        config.validate()?;
        let strategy = Strategy::Local(LocalStrategy::new(config, identities.clone()));
        Ok(Self::with_strategy(config, strategy, identities, revocations))
    }

    /// Engine running the federated strategy against `provider`.
    pub fn federated(
        config: &AuthConfig,
        identities: Arc<dyn IdentityStore>,
        revocations: Arc<dyn RevocationStore>,
        provider: Arc<dyn ExternalProvider>,
        cache: Arc<dyn VerificationCache>,
    ) -> AuthResult<Self> {
        config.validate()?;
        let strategy = Strategy::Federated(FederatedStrategy::new(
            config,
            identities.clone(),
            provider,
            cache,
        ));
        Ok(Self::with_strategy(config, strategy, identities, revocations))
    }

    /// Build the engine described by `config` on SurrealDB stores.
    ///
    /// The federated strategy uses a [`JwksProvider`] and an in-process
    /// verification cache.
    pub async fn from_config(config: &AuthConfig, db: Db) -> anyhow::Result<Self> {
        config.validate()?;

        let unique_fields = [
            config.username_field.as_str(),
            config.federated_id_field.as_str(),
        ];
        let identities: Arc<dyn IdentityStore> =
            Arc::new(SurrealIdentityStore::new(db.clone(), &unique_fields).await?);
        let revocations: Arc<dyn RevocationStore> =
            Arc::new(SurrealRevocationStore::new(db).await?);

        let engine = match config.strategy {
            StrategyKind::Local => Self::local(config, identities, revocations)?,
            StrategyKind::Federated => {
                let provider_config = config.federated.as_ref().ok_or_else(|| {
                    anyhow::anyhow!("federated strategy requires provider settings")
                })?;
                let provider = Arc::new(JwksProvider::new(provider_config)?);
                Self::federated(
                    config,
                    identities,
                    revocations,
                    provider,
                    Arc::new(MemoryVerificationCache::new()),
                )?
            }
        };

        info!("Authenticator ready with {} strategy", engine.strategy.kind());
        Ok(engine)
    }

    fn with_strategy(
        config: &AuthConfig,
        strategy: Strategy,
        identities: Arc<dyn IdentityStore>,
        revocations: Arc<dyn RevocationStore>,
    ) -> Self {
        Self {
            strategy,
            identities,
            revocations,
            username_field: config.username_field.clone(),
            password_field: config.password_field.clone(),
            federated_id_field: config.federated_id_field.clone(),
        }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    /// Create an identity from `payload`.
    ///
    /// Local: the username and password fields are required and the password
    /// is stored as a credential record. Federated: the payload must carry
    /// the provider subject id, or `external_token` must verify to one.
    pub async fn register(
        &self,
        payload: Value,
        external_token: Option<&str>,
    ) -> AuthResult<Identity> {
        let Value::Object(mut attributes) = payload else {
            return Err(AuthError::InvalidPayload(
                "registration payload must be an object".to_string(),
            ));
        };
        attributes.remove("id");

        match &self.strategy {
            Strategy::Local(_) => {
                if required_str(&attributes, &self.username_field).is_none() {
                    return Err(missing_field(&self.username_field));
                }
                let password = required_str(&attributes, &self.password_field)
                    .ok_or_else(|| missing_field(&self.password_field))?;

                let record = self.strategy.create_password(password)?;
                attributes.insert(
                    self.password_field.clone(),
                    Value::String(record.into_inner()),
                );
            }
            Strategy::Federated(federated) => {
                attributes.remove(&self.password_field);

                if required_str(&attributes, &self.federated_id_field).is_none() {
                    let token = external_token
                        .map(strip_bearer)
                        .filter(|t| !t.is_empty())
                        .ok_or(AuthError::MissingFederatedId)?;
                    let claims = federated
                        .verify_external(token)
                        .await?
                        .ok_or(AuthError::Unauthorized)?;
                    attributes.insert(
                        self.federated_id_field.clone(),
                        Value::String(claims.subject_id.into_inner()),
                    );
                }
            }
        }

        match self.identities.create(attributes).await {
            Ok(identity) => {
                info!("Registered identity {}", identity.id);
                Ok(identity.without(&self.password_field))
            }
            Err(StoreError::DuplicateKey { field }) => {
                debug!("Registration rejected, `{}` already taken", field);
                Err(AuthError::DuplicateIdentity)
            }
            Err(e) => Err(AuthError::internal("Identity create failed", e)),
        }
    }

    /// Replace the stored password of `id`, writing a current-scheme record.
    pub async fn update_credential(&self, id: &IdentityId, new_plaintext: &str) -> AuthResult<()> {
        let record = self.strategy.create_password(new_plaintext)?;

        let mut patch = Map::new();
        patch.insert(
            self.password_field.clone(),
            Value::String(record.into_inner()),
        );

        match self.identities.update_by_id(id, patch).await {
            Ok(Some(_)) => {
                info!("Updated credential for identity {}", id);
                Ok(())
            }
            Ok(None) => Err(AuthError::UnknownIdentity),
            Err(e) => Err(AuthError::internal("Credential update failed", e)),
        }
    }

    /// Authenticate and issue a session. `None` means the credentials were
    /// rejected.
    ///
    /// Local logins get a freshly signed token; federated logins reuse the
    /// verified external token.
    pub async fn login(&self, credentials: &Credentials) -> AuthResult<Option<Session>> {
        let credentials = match credentials {
            Credentials::External { token } => Credentials::external(strip_bearer(token)),
            other => other.clone(),
        };

        let Some(identity) = self.strategy.login(&credentials).await? else {
            return Ok(None);
        };

        let token = match credentials {
            Credentials::Password { .. } => self.strategy.create_token(&identity.id)?,
            Credentials::External { token } => token,
        };

        Ok(Some(Session { identity, token }))
    }

    /// Decode a token (with or without `Bearer `) under the active strategy.
    pub async fn verify_token(&self, raw: &str) -> AuthResult<Option<Claims>> {
        let token = strip_bearer(raw);
        if token.is_empty() {
            return Ok(None);
        }
        self.strategy.verify_token(token).await
    }

    /// Gate one request given its `Authorization` header value.
    ///
    /// Authentication runs first; bans are only consulted for tokens that
    /// authenticate, so a forged or expired token is never `Forbidden`.
    pub async fn request_gate(&self, header: Option<&str>) -> AuthResult<Gate> {
        let token = header.map(strip_bearer).unwrap_or_default();
        if token.is_empty() {
            return Ok(Gate::Unauthenticated);
        }

        let Some(identity) = self.strategy.middleware(token).await? else {
            return Ok(Gate::Unauthenticated);
        };

        if self.ban_active(&BanKey::Token(token.to_string())).await? {
            debug!("Request with revoked token for identity {}", identity.id);
            return Ok(Gate::Forbidden);
        }
        if self.ban_active(&BanKey::Subject(identity.id.clone())).await? {
            debug!("Request from banned identity {}", identity.id);
            return Ok(Gate::Forbidden);
        }

        Ok(Gate::Authenticated(identity))
    }

    /// Federated login that also refuses banned tokens and subjects.
    pub async fn federated_access(&self, token: &str) -> AuthResult<Identity> {
        if self.strategy.kind() != StrategyKind::Federated {
            return Err(AuthError::Unsupported("federated_access"));
        }

        let token = strip_bearer(token);
        let identity = self
            .strategy
            .login(&Credentials::external(token))
            .await?
            .ok_or(AuthError::Unauthorized)?;

        if self.ban_active(&BanKey::Token(token.to_string())).await?
            || self.ban_active(&BanKey::Subject(identity.id.clone())).await?
        {
            return Err(AuthError::Forbidden);
        }

        Ok(identity)
    }

    /// End a session: drop strategy state, then ban the token.
    pub async fn logout(&self, token: &str) {
        let token = strip_bearer(token);
        if token.is_empty() {
            return;
        }
        self.strategy.logout(token).await;
        self.revoke_token(token).await;
    }

    /// Revoke a token or every token of an identity. Failures are logged,
    /// never returned.
    pub async fn ban(&self, target: BanKey) {
        match normalize(target) {
            BanKey::Token(token) => {
                if token.is_empty() {
                    return;
                }
                self.strategy.logout(&token).await;
                self.revoke_token(&token).await;
            }
            key @ BanKey::Subject(_) => {
                self.insert_ban(BanEntry::permanent(key)).await;
            }
        }
    }

    /// Lift a ban. Failures are logged, never returned.
    pub async fn unban(&self, target: BanKey) {
        let key = normalize(target);
        match self.revocations.delete(&key).await {
            Ok(true) => info!("Lifted {} ban", key.kind()),
            Ok(false) => debug!("No {} ban to lift", key.kind()),
            Err(e) => error!("Failed to lift {} ban: {}", key.kind(), e),
        }
    }

    /// Evict cached verification for a token. Never fails.
    pub async fn purge(&self, token: &str) {
        self.strategy.purge(strip_bearer(token)).await;
    }

    /// Whether an active ban exists for `target`.
    pub async fn is_revoked(&self, target: &BanKey) -> AuthResult<bool> {
        self.ban_active(&normalize(target.clone())).await
    }

    async fn ban_active(&self, key: &BanKey) -> AuthResult<bool> {
        self.revocations
            .find_active(key)
            .await
            .map(|entry| entry.is_some())
            .map_err(|e| AuthError::internal("Banlist lookup failed", e))
    }

    /// Token bans lapse with the token itself. Nothing is recorded for a
    /// token that can never authenticate again.
    async fn revoke_token(&self, token: &str) {
        let expires_at = match self.strategy.verify_token(token).await {
            Ok(Some(claims)) => Some(claims.exp),
            // Local verification failures (signature, issuer, domain, expiry) are final
            Ok(None) if self.strategy.kind() == StrategyKind::Local => {
                debug!("Token does not verify, no ban recorded");
                return;
            }
            _ => match unverified_expiry(token) {
                Some(exp) if exp <= unix_now() => {
                    debug!("Token already expired, no ban recorded");
                    return;
                }
                other => other,
            },
        };
        self.insert_ban(BanEntry::new(BanKey::Token(token.to_string()), expires_at))
            .await;
    }

    async fn insert_ban(&self, entry: BanEntry) {
        let kind = entry.key.kind();
        match self.revocations.insert(entry).await {
            Ok(true) => info!("Recorded {} ban", kind),
            Ok(false) => debug!("{} ban already active", kind),
            Err(e) => error!("Failed to record {} ban: {}", kind, e),
        }
    }
}

fn required_str<'a>(attributes: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    attributes
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn missing_field(field: &str) -> AuthError {
    warn!("Registration payload missing `{}`", field);
    AuthError::InvalidPayload(format!("missing field `{}`", field))
}

fn normalize(key: BanKey) -> BanKey {
    match key {
        BanKey::Token(token) => BanKey::Token(strip_bearer(&token).to_string()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{identity_store, memory_db, revocation_store};
    use async_trait::async_trait;
    use serde_json::json;

    struct BrokenBanlist;

    #[async_trait]
    impl RevocationStore for BrokenBanlist {
        async fn insert(&self, _entry: BanEntry) -> Result<bool, StoreError> {
            Err(StoreError::Backend(anyhow::anyhow!("banlist down")))
        }

        async fn find_active(&self, _key: &BanKey) -> Result<Option<BanEntry>, StoreError> {
            Err(StoreError::Backend(anyhow::anyhow!("banlist down")))
        }

        async fn delete(&self, _key: &BanKey) -> Result<bool, StoreError> {
            Err(StoreError::Backend(anyhow::anyhow!("banlist down")))
        }
    }

    fn config() -> AuthConfig {
        let mut config = AuthConfig::local("engine-secret");
        config.work_factor = 1_000;
        config
    }

    async fn local_engine() -> Authenticator {
        let db = memory_db().await;
        Authenticator::local(
            &config(),
            identity_store(&db).await,
            revocation_store(&db).await,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let db = memory_db().await;
        let result = Authenticator::local(
            &AuthConfig::local(""),
            identity_store(&db).await,
            revocation_store(&db).await,
        );
        assert!(matches!(result, Err(AuthError::Config(_))));
    }

    #[tokio::test]
    async fn test_register_requires_fields() {
        let engine = local_engine().await;

        let missing_password = engine.register(json!({"email": "a@x.com"}), None).await;
        assert_eq!(
            missing_password,
            Err(AuthError::InvalidPayload("missing field `password`".to_string()))
        );

        let missing_email = engine.register(json!({"password": "pw"}), None).await;
        assert!(matches!(missing_email, Err(AuthError::InvalidPayload(_))));

        let not_object = engine.register(json!(["a@x.com"]), None).await;
        assert!(matches!(not_object, Err(AuthError::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn test_register_hides_credential() {
        let engine = local_engine().await;
        let identity = engine
            .register(json!({"email": "a@x.com", "password": "pw1", "id": "forged"}), None)
            .await
            .unwrap();

        assert!(identity.get("password").is_none());
        assert_ne!(identity.id.as_str(), "forged");
    }

    #[tokio::test]
    async fn test_update_credential() {
        let engine = local_engine().await;
        let identity = engine
            .register(json!({"email": "a@x.com", "password": "old"}), None)
            .await
            .unwrap();

        engine.update_credential(&identity.id, "new").await.unwrap();

        let old = engine.login(&Credentials::password("a@x.com", "old")).await.unwrap();
        assert!(old.is_none());
        let new = engine.login(&Credentials::password("a@x.com", "new")).await.unwrap();
        assert!(new.is_some());

        assert_eq!(
            engine
                .update_credential(&IdentityId::new("missing"), "pw")
                .await,
            Err(AuthError::UnknownIdentity)
        );
    }

    #[tokio::test]
    async fn test_gate_rejects_missing_header() {
        let engine = local_engine().await;
        assert_eq!(engine.request_gate(None).await, Ok(Gate::Unauthenticated));
        assert_eq!(engine.request_gate(Some("")).await, Ok(Gate::Unauthenticated));
        assert_eq!(
            engine.request_gate(Some("Bearer ")).await,
            Ok(Gate::Unauthenticated)
        );
        assert_eq!(
            engine.request_gate(Some("Bearer not.a.jwt")).await,
            Ok(Gate::Unauthenticated)
        );
    }

    #[tokio::test]
    async fn test_federated_access_needs_federated_strategy() {
        let engine = local_engine().await;
        assert_eq!(
            engine.federated_access("tok").await,
            Err(AuthError::Unsupported("federated_access"))
        );
    }

    #[tokio::test]
    async fn test_banlist_outage() {
        let db = memory_db().await;
        let engine =
            Authenticator::local(&config(), identity_store(&db).await, Arc::new(BrokenBanlist))
                .unwrap();
        engine
            .register(json!({"email": "a@x.com", "password": "pw1"}), None)
            .await
            .unwrap();
        let session = engine
            .login(&Credentials::password("a@x.com", "pw1"))
            .await
            .unwrap()
            .unwrap();
        let header = format!("Bearer {}", session.token);

        // Lenient operations complete without surfacing the failure
        engine.ban(BanKey::Token(session.token.clone())).await;
        engine.ban(BanKey::Subject(session.identity.id.clone())).await;
        engine.unban(BanKey::Token(session.token.clone())).await;
        engine.logout(&header).await;
        engine.purge(&header).await;

        // A valid token is never admitted without a banlist answer
        assert_eq!(engine.request_gate(Some(&header)).await, Err(AuthError::Internal));
        assert_eq!(
            engine.is_revoked(&BanKey::Subject(session.identity.id.clone())).await,
            Err(AuthError::Internal)
        );
    }

    #[test]
    fn test_gate_into_result() {
        assert_eq!(Gate::Unauthenticated.into_result(), Err(AuthError::Unauthorized));
        assert_eq!(Gate::Forbidden.into_result(), Err(AuthError::Forbidden));
        assert!(!Gate::Forbidden.is_authenticated());
    }
}
