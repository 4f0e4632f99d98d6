//! NewType wrappers for the identifiers and opaque strings the engine passes
//! around.
//!
//! Keeping these distinct stops a raw bearer token from being handed to
//! something that expects a subject id, or a credential record from being
//! logged as if it were a username.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

newtype_string!(
    /// Stable identifier of an identity, minted by the identity store.
    ///
    /// This is what ends up in the `sub` claim of issued tokens and what
    /// subject-keyed ban entries refer to.
    IdentityId
);

newtype_string!(
    /// Stored password credential: `salt$derivedKeyHex` for the current
    /// scheme, or an Argon2 PHC string for legacy records.
    CredentialRecord
);

newtype_string!(
    /// Subject identifier asserted by an external identity provider
    /// (e.g. the `sub`/`user_id` of a Firebase ID token).
    ExternalSubject
);

/// Strip an optional `Bearer ` scheme prefix from a header value or token.
pub fn strip_bearer(raw: &str) -> &str {
    let raw = raw.trim();
    raw.strip_prefix("Bearer ").map(str::trim).unwrap_or(raw)
}

/// Current Unix time in whole seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
