//! Verification strategies. One is chosen when the engine is built and
//! never changes afterwards.

pub mod federated;
pub mod local;

use crate::config::StrategyKind;
use crate::error::{AuthError, AuthResult};
use crate::identity::Identity;
use crate::token::Claims;
use crate::types::{CredentialRecord, IdentityId};

pub use federated::FederatedStrategy;
pub use local::LocalStrategy;

/// Login input for either strategy.
#[derive(Debug, Clone)]
pub enum Credentials {
    Password { username: String, password: String },
    External { token: String },
}

impl Credentials {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Password {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn external(token: impl Into<String>) -> Self {
        Self::External {
            token: token.into(),
        }
    }
}

pub enum Strategy {
    Local(LocalStrategy),
    Federated(FederatedStrategy),
}

impl Strategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Local(_) => StrategyKind::Local,
            Self::Federated(_) => StrategyKind::Federated,
        }
    }

    pub fn create_password(&self, plaintext: &str) -> AuthResult<CredentialRecord> {
        match self {
            Self::Local(s) => s.hasher().create_password(plaintext),
            Self::Federated(_) => Err(AuthError::Unsupported("create_password")),
        }
    }

    pub fn verify_password(&self, plaintext: &str, record: &CredentialRecord) -> bool {
        match self {
            Self::Local(s) => s.hasher().verify_password(plaintext, record),
            Self::Federated(_) => false,
        }
    }

    /// Authenticate credentials. `None` means rejected.
    pub async fn login(&self, credentials: &Credentials) -> AuthResult<Option<Identity>> {
        match (self, credentials) {
            (Self::Local(s), Credentials::Password { username, password }) => {
                s.login(username, password).await
            }
            (Self::Federated(s), Credentials::External { token }) => s.login(token).await,
            (Self::Local(_), Credentials::External { .. }) => {
                Err(AuthError::Unsupported("external token login"))
            }
            (Self::Federated(_), Credentials::Password { .. }) => {
                Err(AuthError::Unsupported("password login"))
            }
        }
    }

    pub fn create_token(&self, subject: &IdentityId) -> AuthResult<String> {
        match self {
            Self::Local(s) => s.create_token(subject),
            Self::Federated(_) => Err(AuthError::Unsupported("create_token")),
        }
    }

    pub async fn verify_token(&self, token: &str) -> AuthResult<Option<Claims>> {
        match self {
            Self::Local(s) => Ok(s.verify_token(token)),
            Self::Federated(s) => s.verify_token(token).await,
        }
    }

    /// Resolve a bearer token to the current identity.
    pub async fn middleware(&self, token: &str) -> AuthResult<Option<Identity>> {
        match self {
            Self::Local(s) => s.middleware(token).await,
            Self::Federated(s) => s.middleware(token).await,
        }
    }

    /// Drop any per-token state. Always succeeds.
    pub async fn logout(&self, token: &str) -> bool {
        match self {
            Self::Local(_) => true,
            Self::Federated(s) => s.logout(token).await,
        }
    }

    pub async fn purge(&self, token: &str) -> bool {
        self.logout(token).await
    }
}
