//! Configuration parsed from environment variables.
//!
//! DESIGN
//! ======
//! Each collaborator owns a typed config with its own `from_env`; this module
//! holds the shared parsing helpers and the top-level `AppConfig` the binary
//! builds at startup. Optional knobs fall back to constants; secrets and
//! endpoints without a safe default are required.

use std::path::PathBuf;
use std::time::Duration;

use crate::identity::IdentityConfig;
use crate::profile::FirestoreConfig;
use crate::session::ReconcilerConfig;

pub const DEFAULT_HTTP_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const STORE_DIR_NAME: &str = "fitsession";

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

// =============================================================================
// HELPERS
// =============================================================================

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

pub(crate) fn require_env(key: &'static str) -> Result<String, ConfigError> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(key)),
    }
}

pub(crate) fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_owned())
        .trim_end_matches('/')
        .to_owned()
}

/// HTTP client timeouts shared by the REST collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub request: Duration,
    pub connect: Duration,
}

impl HttpTimeouts {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            request: Duration::from_secs(env_parse("HTTP_REQUEST_TIMEOUT_SECS", DEFAULT_HTTP_REQUEST_TIMEOUT_SECS)),
            connect: Duration::from_secs(env_parse("HTTP_CONNECT_TIMEOUT_SECS", DEFAULT_HTTP_CONNECT_TIMEOUT_SECS)),
        }
    }

    pub(crate) fn client(self) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .timeout(self.request)
            .connect_timeout(self.connect)
            .build()
    }
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(DEFAULT_HTTP_REQUEST_TIMEOUT_SECS),
            connect: Duration::from_secs(DEFAULT_HTTP_CONNECT_TIMEOUT_SECS),
        }
    }
}

// =============================================================================
// CREDENTIAL STORE
// =============================================================================

/// Location and key for the encrypted on-device store.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub dir: PathBuf,
    pub passphrase: String,
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig").field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl StoreConfig {
    /// Required: `CREDENTIAL_STORE_KEY`. Optional: `CREDENTIAL_STORE_DIR`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let passphrase = require_env("CREDENTIAL_STORE_KEY")?;
        let dir = std::env::var("CREDENTIAL_STORE_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map_or_else(default_store_dir, PathBuf::from);
        Ok(Self { dir, passphrase })
    }
}

fn default_store_dir() -> PathBuf {
    dirs::data_local_dir().map_or_else(|| PathBuf::from(".").join(format!(".{STORE_DIR_NAME}")), |d| d.join(STORE_DIR_NAME))
}

// =============================================================================
// APP CONFIG
// =============================================================================

/// Everything the binary needs to wire the reconciler.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub identity: IdentityConfig,
    pub profile: FirestoreConfig,
    pub store: StoreConfig,
    pub reconciler: ReconcilerConfig,
}

impl AppConfig {
    /// Load every section from the environment.
    ///
    /// # Errors
    ///
    /// Returns the first missing or invalid required value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            identity: IdentityConfig::from_env()?,
            profile: FirestoreConfig::from_env()?,
            store: StoreConfig::from_env()?,
            reconciler: ReconcilerConfig::from_env()?,
        })
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
