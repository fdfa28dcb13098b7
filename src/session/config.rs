//! Reconciler tuning knobs parsed from environment variables.

use std::time::Duration;

use crate::config::{ConfigError, env_parse};

pub const DEFAULT_PROFILE_COLLECTION: &str = "users";
pub const DEFAULT_PROVIDER_WARMUP_MS: u64 = 500;
pub const DEFAULT_RESTORE_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_RESTORE_RETRIES: u32 = 3;
pub const DEFAULT_RESTORE_RETRY_BASE_MS: u64 = 250;
pub const DEFAULT_REGISTRATION_PULSE_MS: u64 = 2000;

/// What a provider notification carrying no user does to local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderSignOutPolicy {
    /// Observe and log only; `sign_out()` is the sole sign-out path.
    #[default]
    Ignore,
    /// Treat it as a revoked session: clear the store and settle signed out.
    ClearSession,
}

impl ProviderSignOutPolicy {
    fn parse(raw: Option<&str>) -> Result<Self, ConfigError> {
        match raw.map(str::trim).unwrap_or("ignore") {
            "ignore" | "" => Ok(Self::Ignore),
            "clear" => Ok(Self::ClearSession),
            other => Err(ConfigError::Invalid { var: "PROVIDER_SIGN_OUT_POLICY", value: other.to_owned() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Collection holding one profile document per uid.
    pub profile_collection: String,
    /// Delay before the restore sign-in; some providers reject calls issued
    /// right after process start.
    pub provider_warmup: Duration,
    /// Upper bound on a whole restore pass.
    pub restore_timeout: Duration,
    /// Sign-in attempts during restore when the provider is unreachable.
    pub restore_retries: u32,
    /// Linear back-off step between restore sign-in attempts.
    pub restore_retry_base: Duration,
    /// How long `registration_completed` stays raised.
    pub registration_pulse: Duration,
    pub provider_sign_out: ProviderSignOutPolicy,
}

impl ReconcilerConfig {
    /// Optional:
    /// - `PROFILE_COLLECTION` (default `users`)
    /// - `PROVIDER_WARMUP_MS` (default 500)
    /// - `RESTORE_TIMEOUT_SECS` (default 15)
    /// - `RESTORE_RETRIES` (default 3)
    /// - `RESTORE_RETRY_BASE_MS` (default 250)
    /// - `REGISTRATION_PULSE_MS` (default 2000)
    /// - `PROVIDER_SIGN_OUT_POLICY`: `ignore` (default) or `clear`
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown sign-out policy.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            profile_collection: std::env::var("PROFILE_COLLECTION")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PROFILE_COLLECTION.to_owned()),
            provider_warmup: Duration::from_millis(env_parse("PROVIDER_WARMUP_MS", DEFAULT_PROVIDER_WARMUP_MS)),
            restore_timeout: Duration::from_secs(env_parse("RESTORE_TIMEOUT_SECS", DEFAULT_RESTORE_TIMEOUT_SECS)),
            restore_retries: env_parse("RESTORE_RETRIES", DEFAULT_RESTORE_RETRIES),
            restore_retry_base: Duration::from_millis(env_parse("RESTORE_RETRY_BASE_MS", DEFAULT_RESTORE_RETRY_BASE_MS)),
            registration_pulse: Duration::from_millis(env_parse("REGISTRATION_PULSE_MS", DEFAULT_REGISTRATION_PULSE_MS)),
            provider_sign_out: ProviderSignOutPolicy::parse(std::env::var("PROVIDER_SIGN_OUT_POLICY").ok().as_deref())?,
        })
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            profile_collection: DEFAULT_PROFILE_COLLECTION.to_owned(),
            provider_warmup: Duration::from_millis(DEFAULT_PROVIDER_WARMUP_MS),
            restore_timeout: Duration::from_secs(DEFAULT_RESTORE_TIMEOUT_SECS),
            restore_retries: DEFAULT_RESTORE_RETRIES,
            restore_retry_base: Duration::from_millis(DEFAULT_RESTORE_RETRY_BASE_MS),
            registration_pulse: Duration::from_millis(DEFAULT_REGISTRATION_PULSE_MS),
            provider_sign_out: ProviderSignOutPolicy::Ignore,
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
