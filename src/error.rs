//! Error taxonomy surfaced at the engine boundary.
//!
//! Infrastructure failures never cross this boundary with their original
//! text: they are logged where they happen and collapse into
//! [`AuthError::Internal`].

use std::fmt;

use tracing::error;

/// Errors returned by the authentication engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Missing, malformed, unsigned or expired token.
    Unauthorized,

    /// The token or its subject has been revoked.
    Forbidden,

    /// A unique identity field (e.g. email) is already taken.
    DuplicateIdentity,

    /// The external provider verified the token, but no local identity is
    /// mapped to its subject yet. Callers may offer provisioning.
    NewFederatedIdentity,

    /// Federated registration without a provider-issued subject id.
    MissingFederatedId,

    /// The registration payload is missing a required field or is not an
    /// object.
    InvalidPayload(String),

    /// No identity exists with the given id.
    UnknownIdentity,

    /// The active strategy does not offer this operation.
    Unsupported(&'static str),

    /// Construction-time configuration is invalid.
    Config(String),

    /// Unexpected store or provider failure. Details are only logged.
    Internal,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "Authentication required"),
            Self::Forbidden => write!(f, "Access has been revoked"),
            Self::DuplicateIdentity => write!(f, "An identity with this unique field already exists"),
            Self::NewFederatedIdentity => write!(f, "Federated identity is not registered"),
            Self::MissingFederatedId => write!(f, "Federated subject id is missing"),
            Self::InvalidPayload(msg) => write!(f, "Invalid payload: {}", msg),
            Self::UnknownIdentity => write!(f, "Identity not found"),
            Self::Unsupported(op) => write!(f, "Operation not supported by this strategy: {}", op),
            Self::Config(msg) => write!(f, "Invalid configuration: {}", msg),
            Self::Internal => write!(f, "Internal error"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Result type for engine operations.
pub type AuthResult<T> = Result<T, AuthError>;

impl AuthError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::DuplicateIdentity => "duplicate_identity",
            Self::NewFederatedIdentity => "new_federated_identity",
            Self::MissingFederatedId => "missing_federated_id",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::UnknownIdentity => "unknown_identity",
            Self::Unsupported(_) => "unsupported",
            Self::Config(_) => "config",
            Self::Internal => "internal",
        }
    }

    /// Log an infrastructure failure and reduce it to [`AuthError::Internal`].
    pub fn internal(context: &str, err: impl fmt::Display) -> Self {
        error!("{}: {}", context, err);
        Self::Internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_display() {
        assert_eq!(AuthError::Unauthorized.to_string(), "Authentication required");
        assert_eq!(AuthError::Internal.to_string(), "Internal error");
        assert_eq!(
            AuthError::InvalidPayload("missing field `email`".to_string()).to_string(),
            "Invalid payload: missing field `email`"
        );
    }

    #[test]
    fn test_internal_hides_details() {
        let err = AuthError::internal("identity lookup failed", "connection refused to 10.0.0.7");
        assert_eq!(err, AuthError::Internal);
        assert!(!err.to_string().contains("10.0.0.7"));
    }

    #[test]
    fn test_codes_are_distinct() {
        assert_ne!(
            AuthError::NewFederatedIdentity.code(),
            AuthError::Unauthorized.code()
        );
        assert_eq!(AuthError::DuplicateIdentity.code(), "duplicate_identity");
    }
}
