//! Construction-time configuration for the authentication engine.
//!
//! Configuration is fixed once an [`Authenticator`](crate::Authenticator) is
//! built. It can be assembled in code, read from `AUTHGATE_*` environment
//! variables, or loaded from a JSON file whose string values may reference
//! environment variables as `${NAME}`.

use serde::{Deserialize, Serialize};
use std::{env, fmt, fs, path::Path, path::PathBuf, str::FromStr, time::Duration};

use crate::error::{AuthError, AuthResult};
use crate::identity::LookupOptions;
use crate::provider::jwks::DEFAULT_CACHE_TTL_SECONDS;

/// Default PBKDF2 iteration count for new credential records.
pub const DEFAULT_WORK_FACTOR: u32 = 100_000;

/// Default lifetime of locally issued tokens (24 hours).
pub const DEFAULT_TOKEN_TTL_SECONDS: u64 = 24 * 60 * 60;

/// Google secure-token JWKS endpoint used to verify Firebase ID tokens.
pub const FIREBASE_JWKS_URL: &str =
    "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com";

/// Which verification strategy the engine runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Username + password credentials, locally signed tokens.
    #[default]
    #[serde(alias = "simple")]
    Local,
    /// Bearer tokens issued and verified by an external provider.
    #[serde(alias = "firebase")]
    Federated,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Federated => "federated",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "simple" => Ok(Self::Local),
            "federated" | "firebase" => Ok(Self::Federated),
            other => Err(AuthError::Config(format!("unknown strategy `{}`", other))),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signing/keying secret. Never printed.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretKey(String);

impl SecretKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(***)")
    }
}

/// External provider settings for the federated strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedConfig {
    /// JWKS endpoint URL for key fetching
    pub jwks_url: String,
    /// Expected `iss` claim
    pub issuer: String,
    /// Expected `aud` claim, if any
    #[serde(default)]
    pub audience: Option<String>,
    /// JWKS cache TTL in seconds (default: 3600)
    #[serde(default = "default_jwks_cache_seconds")]
    pub jwks_cache_seconds: u64,
    /// Whether to allow stale JWKS cache on fetch failure
    #[serde(default = "default_true")]
    pub allow_stale_jwks: bool,
}

impl FederatedConfig {
    /// Provider settings for a generic RS256/JWKS issuer.
    pub fn jwks(jwks_url: impl Into<String>, issuer: impl Into<String>, audience: Option<String>) -> Self {
        Self {
            jwks_url: jwks_url.into(),
            issuer: issuer.into(),
            audience,
            jwks_cache_seconds: DEFAULT_CACHE_TTL_SECONDS,
            allow_stale_jwks: true,
        }
    }

    /// Provider settings for Firebase Authentication ID tokens.
    pub fn firebase(project_id: &str) -> Self {
        Self::jwks(
            FIREBASE_JWKS_URL,
            format!("https://securetoken.google.com/{}", project_id),
            Some(project_id.to_string()),
        )
    }
}

/// Authentication engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Active verification strategy
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Unique identity field used as the login name
    #[serde(default = "default_username_field")]
    pub username_field: String,
    /// Identity field holding the credential record
    #[serde(default = "default_password_field")]
    pub password_field: String,
    /// Identity field holding the external provider's subject id
    #[serde(default = "default_federated_id_field")]
    pub federated_id_field: String,
    /// Secret used for token signing and password keying
    pub secret_key: SecretKey,
    /// `iss` claim of issued tokens
    #[serde(default = "default_token_issuer")]
    pub token_issuer: String,
    /// `domain` claim of issued tokens
    #[serde(default = "default_token_domain")]
    pub token_domain: String,
    /// PBKDF2 iterations for new credential records
    #[serde(default = "default_work_factor")]
    pub work_factor: u32,
    /// Lifetime of locally issued tokens
    #[serde(default = "default_token_ttl_seconds")]
    pub token_ttl_seconds: u64,
    /// Key prefix for verification cache entries
    #[serde(default = "default_cache_prefix")]
    pub cache_prefix: String,
    /// Upper bound on verification cache TTL (token lifetime otherwise)
    #[serde(default)]
    pub max_cache_ttl_seconds: Option<u64>,
    /// External provider settings (federated strategy)
    #[serde(default)]
    pub federated: Option<FederatedConfig>,
    /// Populate/projection directives passed to the identity store
    #[serde(default)]
    pub lookup: LookupOptions,
}

fn default_username_field() -> String {
    "email".to_string()
}

fn default_password_field() -> String {
    "password".to_string()
}

fn default_federated_id_field() -> String {
    "federatedId".to_string()
}

fn default_token_issuer() -> String {
    "authgate".to_string()
}

fn default_token_domain() -> String {
    "localhost".to_string()
}

fn default_work_factor() -> u32 {
    DEFAULT_WORK_FACTOR
}

fn default_token_ttl_seconds() -> u64 {
    DEFAULT_TOKEN_TTL_SECONDS
}

fn default_cache_prefix() -> String {
    "authgate:token".to_string()
}

fn default_jwks_cache_seconds() -> u64 {
    DEFAULT_CACHE_TTL_SECONDS
}

fn default_true() -> bool {
    true
}

impl AuthConfig {
    /// Config for the local strategy with default field names.
    pub fn local(secret_key: impl Into<String>) -> Self {
        Self {
            strategy: StrategyKind::Local,
            username_field: default_username_field(),
            password_field: default_password_field(),
            federated_id_field: default_federated_id_field(),
            secret_key: SecretKey::new(secret_key),
            token_issuer: default_token_issuer(),
            token_domain: default_token_domain(),
            work_factor: DEFAULT_WORK_FACTOR,
            token_ttl_seconds: DEFAULT_TOKEN_TTL_SECONDS,
            cache_prefix: default_cache_prefix(),
            max_cache_ttl_seconds: None,
            federated: None,
            lookup: LookupOptions::default(),
        }
    }

    /// Config for the federated strategy.
    pub fn federated(secret_key: impl Into<String>, provider: FederatedConfig) -> Self {
        Self {
            strategy: StrategyKind::Federated,
            federated: Some(provider),
            ..Self::local(secret_key)
        }
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_seconds)
    }

    pub fn max_cache_ttl(&self) -> Option<Duration> {
        self.max_cache_ttl_seconds.map(Duration::from_secs)
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> AuthResult<()> {
        if self.secret_key.is_empty() {
            return Err(AuthError::Config("secret_key must not be empty".to_string()));
        }

        for (name, value) in [
            ("username_field", &self.username_field),
            ("password_field", &self.password_field),
            ("federated_id_field", &self.federated_id_field),
        ] {
            if !is_field_name(value) {
                return Err(AuthError::Config(format!(
                    "{} `{}` is not a valid field name",
                    name, value
                )));
            }
        }

        if self.username_field == self.password_field {
            return Err(AuthError::Config(
                "username_field and password_field must differ".to_string(),
            ));
        }

        if self.work_factor == 0 {
            return Err(AuthError::Config("work_factor must be at least 1".to_string()));
        }

        if self.token_ttl_seconds == 0 {
            return Err(AuthError::Config("token_ttl_seconds must be positive".to_string()));
        }

        Ok(())
    }

    /// Build a config from `AUTHGATE_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let secret = lookup("AUTHGATE_SECRET_KEY")
            .ok_or_else(|| anyhow::anyhow!("AUTHGATE_SECRET_KEY is not set"))?;
        let mut config = Self::local(secret);

        if let Some(v) = lookup("AUTHGATE_STRATEGY") {
            config.strategy = v.parse()?;
        }
        if let Some(v) = lookup("AUTHGATE_USERNAME_FIELD") {
            config.username_field = v;
        }
        if let Some(v) = lookup("AUTHGATE_PASSWORD_FIELD") {
            config.password_field = v;
        }
        if let Some(v) = lookup("AUTHGATE_FEDERATED_ID_FIELD") {
            config.federated_id_field = v;
        }
        if let Some(v) = lookup("AUTHGATE_TOKEN_ISSUER") {
            config.token_issuer = v;
        }
        if let Some(v) = lookup("AUTHGATE_TOKEN_DOMAIN") {
            config.token_domain = v;
        }
        if let Some(v) = lookup("AUTHGATE_WORK_FACTOR") {
            config.work_factor = v.parse()?;
        }
        if let Some(v) = lookup("AUTHGATE_TOKEN_TTL_SECONDS") {
            config.token_ttl_seconds = v.parse()?;
        }
        if let Some(v) = lookup("AUTHGATE_CACHE_PREFIX") {
            config.cache_prefix = v;
        }
        if let Some(v) = lookup("AUTHGATE_MAX_CACHE_TTL_SECONDS") {
            config.max_cache_ttl_seconds = Some(v.parse()?);
        }

        if let Some(project) = lookup("AUTHGATE_FIREBASE_PROJECT") {
            config.federated = Some(FederatedConfig::firebase(&project));
        } else if let (Some(url), Some(issuer)) =
            (lookup("AUTHGATE_JWKS_URL"), lookup("AUTHGATE_JWT_ISSUER"))
        {
            config.federated = Some(FederatedConfig::jwks(
                url,
                issuer,
                lookup("AUTHGATE_JWT_AUDIENCE"),
            ));
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a config from a JSON file, expanding `${VAR}` references.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)?;
        let mut value: serde_json::Value = serde_json::from_str(&raw)?;
        expand_value(&mut value);
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }
}

/// Locate the config file: `AUTHGATE_CONFIG`, then `./authgate.json`.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("AUTHGATE_CONFIG") {
        return Some(PathBuf::from(p));
    }

    let candidate = PathBuf::from("authgate.json");
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

/// Identity field names end up in store queries, so keep them to plain
/// identifiers.
pub(crate) fn is_field_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

fn expand_value(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => *s = expand_env_vars(s),
        serde_json::Value::Array(items) => items.iter_mut().for_each(expand_value),
        serde_json::Value::Object(map) => map.values_mut().for_each(expand_value),
        _ => {}
    }
}
