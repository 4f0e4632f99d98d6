//! Salted password hashing.
//!
//! New records are `salt$derivedKeyHex` where the derived key is
//! PBKDF2-HMAC-SHA512 over an HMAC-SHA256 digest of the plaintext keyed with
//! the engine secret. Argon2 PHC strings written by older deployments are
//! still accepted on the verify path; they are replaced with the current
//! scheme the next time the credential is updated.

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::config::SecretKey;
use crate::error::{AuthError, AuthResult};
use crate::types::CredentialRecord;

/// Random salt length in bytes (hex encoded in the record).
pub const SALT_BYTES: usize = 32;

/// Length of the derived key in bytes.
pub const DERIVED_KEY_BYTES: usize = 64;

/// Separator between salt and derived key.
pub const RECORD_SEPARATOR: char = '$';

const LEGACY_PREFIX: &str = "$argon2";

/// Derives and verifies password credential records.
#[derive(Clone)]
pub struct CredentialHasher {
    secret: SecretKey,
    work_factor: u32,
}

impl CredentialHasher {
    pub fn new(secret: SecretKey, work_factor: u32) -> Self {
        Self {
            secret,
            work_factor: work_factor.max(1),
        }
    }

    /// Hash a plaintext password into a fresh record with a new random salt.
    pub fn create_password(&self, plaintext: &str) -> AuthResult<CredentialRecord> {
        let mut salt = [0u8; SALT_BYTES];
        OsRng.fill_bytes(&mut salt);
        let salt = hex::encode(salt);

        let key = self.derive(plaintext, &salt)?;
        Ok(CredentialRecord::new(format!(
            "{}{}{}",
            salt,
            RECORD_SEPARATOR,
            hex::encode(key)
        )))
    }

    /// Check a candidate password against a stored record.
    ///
    /// Malformed records never verify.
    pub fn verify_password(&self, plaintext: &str, record: &CredentialRecord) -> bool {
        let stored = record.as_str();

        if is_legacy(stored) {
            return verify_legacy(plaintext, stored);
        }

        let Some((salt, key_hex)) = stored.split_once(RECORD_SEPARATOR) else {
            debug!("Credential record has no separator");
            return false;
        };
        if salt.is_empty() {
            return false;
        }
        let Ok(expected) = hex::decode(key_hex) else {
            debug!("Credential record key is not hex");
            return false;
        };
        let Ok(candidate) = self.derive(plaintext, salt) else {
            return false;
        };

        candidate.as_slice().ct_eq(expected.as_slice()).into()
    }

    /// Whether a record was written by a previous hashing scheme.
    pub fn needs_upgrade(&self, record: &CredentialRecord) -> bool {
        is_legacy(record.as_str())
    }

    fn keyed_digest(&self, plaintext: &str) -> AuthResult<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .map_err(|e| AuthError::internal("Failed to key password digest", e))?;
        mac.update(plaintext.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn derive(&self, plaintext: &str, salt: &str) -> AuthResult<[u8; DERIVED_KEY_BYTES]> {
        let digest = self.keyed_digest(plaintext)?;
        let mut key = [0u8; DERIVED_KEY_BYTES];
        pbkdf2_hmac::<Sha512>(digest.as_bytes(), salt.as_bytes(), self.work_factor, &mut key);
        Ok(key)
    }
}

fn is_legacy(stored: &str) -> bool {
    stored.starts_with(LEGACY_PREFIX)
}

fn verify_legacy(plaintext: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(plaintext.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            debug!("Unparseable legacy credential record: {}", e);
            false
        }
    }
}
