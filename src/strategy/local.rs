//! Username + password strategy with locally signed tokens.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::AuthConfig;
use crate::credential::CredentialHasher;
use crate::error::{AuthError, AuthResult};
use crate::identity::{Identity, IdentityStore, LookupOptions};
use crate::token::{Claims, TokenCodec};
use crate::types::{CredentialRecord, IdentityId, unix_now};

pub struct LocalStrategy {
    hasher: CredentialHasher,
    codec: TokenCodec,
    store: Arc<dyn IdentityStore>,
    username_field: String,
    password_field: String,
    lookup: LookupOptions,
    token_ttl: Duration,
}

impl LocalStrategy {
    pub fn new(config: &AuthConfig, store: Arc<dyn IdentityStore>) -> Self {
        Self {
            hasher: CredentialHasher::new(config.secret_key.clone(), config.work_factor),
            codec: TokenCodec::new(&config.secret_key, &config.token_issuer, &config.token_domain),
            store,
            username_field: config.username_field.clone(),
            password_field: config.password_field.clone(),
            lookup: config.lookup.clone(),
            token_ttl: config.token_ttl(),
        }
    }

    pub fn hasher(&self) -> &CredentialHasher {
        &self.hasher
    }

    /// Look up by username and check the password. Unknown user and wrong
    /// password are indistinguishable to the caller.
    pub async fn login(&self, username: &str, password: &str) -> AuthResult<Option<Identity>> {
        let lookup = self.lookup.including(&self.password_field);
        let found = self
            .store
            .find_by_unique_field(&self.username_field, username, &lookup)
            .await
            .map_err(|e| AuthError::internal("Identity lookup failed", e))?;

        let Some(identity) = found else {
            debug!("Login rejected");
            return Ok(None);
        };

        let verified = identity
            .get_str(&self.password_field)
            .is_some_and(|stored| {
                self.hasher
                    .verify_password(password, &CredentialRecord::new(stored))
            });
        if !verified {
            debug!("Login rejected");
            return Ok(None);
        }

        debug!("Login accepted for identity {}", identity.id);
        Ok(Some(self.lookup.redact(identity, &self.password_field)))
    }

    /// Sign a token for `subject` expiring `token_ttl` from now.
    pub fn create_token(&self, subject: &IdentityId) -> AuthResult<String> {
        let expires_at = unix_now() + self.token_ttl.as_secs() as i64;
        self.codec.sign(&self.codec.claims_for(subject, expires_at))
    }

    pub fn verify_token(&self, token: &str) -> Option<Claims> {
        match self.codec.verify(token) {
            Ok(claims) => Some(claims),
            Err(e) => {
                debug!("Token rejected: {}", e);
                None
            }
        }
    }

    /// Verify the token and load the identity as it is now in the store.
    pub async fn middleware(&self, token: &str) -> AuthResult<Option<Identity>> {
        let Some(claims) = self.verify_token(token) else {
            return Ok(None);
        };

        let found = self
            .store
            .find_by_id(&claims.subject(), &self.lookup)
            .await
            .map_err(|e| AuthError::internal("Identity lookup failed", e))?;

        Ok(found.map(|identity| self.lookup.redact(identity, &self.password_field)))
    }
}
