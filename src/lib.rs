// Core modules
pub mod config;
pub mod db;
pub mod error;
pub mod types;

// Credentials and tokens
pub mod credential;
pub mod token;

// Collaborators
pub mod cache;
pub mod identity;
pub mod provider;
pub mod revocation;

// Engine
pub mod authenticator;
pub mod strategy;

#[cfg(test)]
mod testing;


// Re-export key types and functions
pub use authenticator::{Authenticator, Gate, Session};
pub use cache::{MemoryVerificationCache, VerificationCache};
pub use config::{AuthConfig, FederatedConfig, SecretKey, StrategyKind, resolve_config_path};
pub use credential::CredentialHasher;
pub use db::{DatabaseConfig, Db, create_connection};
pub use error::{AuthError, AuthResult};
pub use identity::{Identity, IdentityStore, LookupOptions, StoreError, SurrealIdentityStore};
pub use provider::{ExternalProvider, JwksProvider, ProviderClaims, ProviderError};
pub use revocation::{BanEntry, BanKey, RevocationStore, SurrealRevocationStore};
pub use strategy::{Credentials, Strategy};
pub use token::{Claims, TokenCodec, TokenError};
pub use types::{CredentialRecord, ExternalSubject, IdentityId};
