//! REST identity provider client (Identity Toolkit style endpoints).
//!
//! Thin HTTP wrapper around `accounts:*` and the secure-token refresh
//! endpoint. The live session (user + tokens) is held in memory only; the
//! reconciler decides what gets persisted. Pure parsing helpers are kept
//! separate from I/O for testability.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use super::{IdentityError, IdentityProvider, UserHandle};
use crate::config::{ConfigError, HttpTimeouts, env_or, require_env};

pub const DEFAULT_IDENTITY_BASE_URL: &str = "https://identitytoolkit.googleapis.com/v1";
pub const DEFAULT_SECURE_TOKEN_BASE_URL: &str = "https://securetoken.googleapis.com/v1";
const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;
/// Refresh this long before the provider-reported expiry.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const CONTINUE_URI: &str = "http://localhost";

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Clone, PartialEq, Eq)]
pub struct IdentityConfig {
    pub api_key: String,
    pub base_url: String,
    pub secure_token_base_url: String,
    pub timeouts: HttpTimeouts,
}

impl std::fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("base_url", &self.base_url)
            .field("secure_token_base_url", &self.secure_token_base_url)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl IdentityConfig {
    /// Required: `IDENTITY_API_KEY`.
    ///
    /// Optional: `IDENTITY_BASE_URL`, `SECURE_TOKEN_BASE_URL`, HTTP timeouts.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_key: require_env("IDENTITY_API_KEY")?,
            base_url: env_or("IDENTITY_BASE_URL", DEFAULT_IDENTITY_BASE_URL),
            secure_token_base_url: env_or("SECURE_TOKEN_BASE_URL", DEFAULT_SECURE_TOKEN_BASE_URL),
            timeouts: HttpTimeouts::from_env(),
        })
    }
}

// =============================================================================
// CLIENT
// =============================================================================

struct LiveSession {
    user: UserHandle,
    id_token: String,
    refresh_token: String,
    expires_at: Instant,
}

pub struct RestIdentityProvider {
    http: reqwest::Client,
    config: IdentityConfig,
    session: Mutex<Option<LiveSession>>,
    state_tx: watch::Sender<Option<UserHandle>>,
}

impl RestIdentityProvider {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: IdentityConfig) -> Result<Self, IdentityError> {
        let http = config
            .timeouts
            .client()
            .map_err(|e| IdentityError::Provider(format!("http client build failed: {e}")))?;
        let (state_tx, _) = watch::channel(None);
        Ok(Self { http, config, session: Mutex::new(None), state_tx })
    }

    fn accounts_url(&self, method: &str) -> String {
        endpoint(&self.config.base_url, &format!("accounts:{method}"), &self.config.api_key)
    }

    async fn post<B, R>(&self, url: &str, body: &B) -> Result<R, IdentityError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| IdentityError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| IdentityError::Network(e.to_string()))?;

        if !(200..300).contains(&status) {
            return Err(classify_error(status, &text));
        }

        serde_json::from_str(&text).map_err(|e| IdentityError::Provider(format!("unexpected response: {e}")))
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<LiveSession>> {
        self.session
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Install a new live session and publish the user.
    fn establish(&self, resp: AuthResponse, is_anonymous: bool) -> UserHandle {
        let user = user_from_response(&resp, is_anonymous);
        let expires_at = Instant::now() + Duration::from_secs(expiry_secs(&resp.expires_in));
        *self.lock_session() = Some(LiveSession {
            user: user.clone(),
            id_token: resp.id_token,
            refresh_token: resp.refresh_token,
            expires_at,
        });
        self.state_tx.send_replace(Some(user.clone()));
        info!(uid = %user.uid, anonymous = is_anonymous, "provider session established");
        user
    }

    async fn refresh_id_token(&self, uid: &str, refresh_token: String) -> Result<String, IdentityError> {
        let url = endpoint(&self.config.secure_token_base_url, "token", &self.config.api_key);
        let body = RefreshRequest { grant_type: "refresh_token", refresh_token: &refresh_token };
        let resp: RefreshResponse = self.post(&url, &body).await?;

        let mut guard = self.lock_session();
        // EDGE: the session may have been replaced while the refresh was in flight.
        if let Some(live) = guard.as_mut().filter(|s| s.user.uid == uid) {
            live.id_token.clone_from(&resp.id_token);
            live.refresh_token = resp.refresh_token;
            live.expires_at = Instant::now() + Duration::from_secs(expiry_secs(&resp.expires_in));
        }
        debug!(uid, "id token refreshed");
        Ok(resp.id_token)
    }
}

#[async_trait::async_trait]
impl IdentityProvider for RestIdentityProvider {
    async fn sign_in_with_email(&self, email: &str, password: &str) -> Result<UserHandle, IdentityError> {
        let body = PasswordRequest { email, password, return_secure_token: true };
        let resp: AuthResponse = self
            .post(&self.accounts_url("signInWithPassword"), &body)
            .await?;
        Ok(self.establish(resp, false))
    }

    async fn create_user(&self, email: &str, password: &str) -> Result<UserHandle, IdentityError> {
        let body = PasswordRequest { email, password, return_secure_token: true };
        let resp: AuthResponse = self.post(&self.accounts_url("signUp"), &body).await?;
        Ok(self.establish(resp, false))
    }

    async fn sign_in_anonymously(&self) -> Result<UserHandle, IdentityError> {
        let body = AnonymousRequest { return_secure_token: true };
        let resp: AuthResponse = self.post(&self.accounts_url("signUp"), &body).await?;
        Ok(self.establish(resp, true))
    }

    async fn sign_out(&self) -> Result<(), IdentityError> {
        let previous = self.lock_session().take();
        self.state_tx.send_replace(None);
        if let Some(live) = previous {
            info!(uid = %live.user.uid, "provider session cleared");
        }
        Ok(())
    }

    async fn get_id_token(&self, user: &UserHandle) -> Result<String, IdentityError> {
        let refresh_token = {
            let guard = self.lock_session();
            let Some(live) = guard.as_ref().filter(|s| s.user.uid == user.uid) else {
                return Err(IdentityError::Rejected {
                    code: "NO_LIVE_SESSION".into(),
                    message: format!("no live session for {}", user.uid),
                });
            };
            if live.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(live.id_token.clone());
            }
            live.refresh_token.clone()
        };
        self.refresh_id_token(&user.uid, refresh_token).await
    }

    async fn fetch_sign_in_methods(&self, email: &str) -> Result<Vec<String>, IdentityError> {
        let body = CreateAuthUriRequest { identifier: email, continue_uri: CONTINUE_URI };
        let resp: CreateAuthUriResponse = self.post(&self.accounts_url("createAuthUri"), &body).await?;
        Ok(resp.signin_methods)
    }

    async fn update_profile(&self, user: &UserHandle, display_name: &str) -> Result<UserHandle, IdentityError> {
        let id_token = self.get_id_token(user).await?;
        let body = UpdateRequest { id_token: &id_token, display_name, return_secure_token: true };
        let resp: UpdateResponse = self.post(&self.accounts_url("update"), &body).await?;

        let updated = UserHandle {
            display_name: resp.display_name.or_else(|| Some(display_name.to_owned())),
            ..user.clone()
        };
        {
            let mut guard = self.lock_session();
            if let Some(live) = guard.as_mut().filter(|s| s.user.uid == user.uid) {
                live.user = updated.clone();
                if let (Some(id), Some(refresh)) = (resp.id_token, resp.refresh_token) {
                    live.id_token = id;
                    live.refresh_token = refresh;
                    live.expires_at = Instant::now()
                        + Duration::from_secs(expiry_secs(resp.expires_in.as_deref().unwrap_or_default()));
                }
            }
        }
        self.state_tx.send_replace(Some(updated.clone()));
        Ok(updated)
    }

    fn current_user(&self) -> Option<UserHandle> {
        self.lock_session().as_ref().map(|s| s.user.clone())
    }

    fn subscribe(&self) -> watch::Receiver<Option<UserHandle>> {
        self.state_tx.subscribe()
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PasswordRequest<'a> {
    email: &'a str,
    password: &'a str,
    return_secure_token: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnonymousRequest {
    return_secure_token: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateAuthUriRequest<'a> {
    identifier: &'a str,
    continue_uri: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateRequest<'a> {
    id_token: &'a str,
    display_name: &'a str,
    return_secure_token: bool,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'a str,
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthResponse {
    pub(crate) local_id: String,
    #[serde(default)]
    pub(crate) email: Option<String>,
    #[serde(default)]
    pub(crate) display_name: Option<String>,
    pub(crate) id_token: String,
    pub(crate) refresh_token: String,
    #[serde(default)]
    pub(crate) expires_in: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateResponse {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateAuthUriResponse {
    #[serde(rename = "signinMethods", default)]
    pub(crate) signin_methods: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

// =============================================================================
// PARSING
// =============================================================================

pub(crate) fn endpoint(base: &str, path: &str, api_key: &str) -> String {
    format!("{}/{path}?key={api_key}", base.trim_end_matches('/'))
}

pub(crate) fn expiry_secs(raw: &str) -> u64 {
    raw.trim().parse::<u64>().unwrap_or(DEFAULT_TOKEN_TTL_SECS)
}

pub(crate) fn user_from_response(resp: &AuthResponse, is_anonymous: bool) -> UserHandle {
    UserHandle {
        uid: resp.local_id.clone(),
        email: resp.email.clone().filter(|e| !e.is_empty()),
        display_name: resp.display_name.clone().filter(|n| !n.is_empty()),
        is_anonymous,
    }
}

/// Extract the provider error code, e.g. `"WEAK_PASSWORD : too short"` -> `WEAK_PASSWORD`.
pub(crate) fn error_code(body: &str) -> Option<String> {
    let envelope: ErrorEnvelope = serde_json::from_str(body).ok()?;
    let code = envelope.error.message.split(':').next()?.trim().to_owned();
    (!code.is_empty()).then_some(code)
}

pub(crate) fn classify_error(status: u16, body: &str) -> IdentityError {
    let code = error_code(body);
    match code.as_deref() {
        Some("EMAIL_EXISTS") => IdentityError::EmailAlreadyInUse,
        Some("INVALID_PASSWORD" | "EMAIL_NOT_FOUND" | "INVALID_LOGIN_CREDENTIALS" | "INVALID_EMAIL") => {
            IdentityError::InvalidCredential
        }
        Some(
            c @ ("USER_DISABLED" | "TOKEN_EXPIRED" | "USER_NOT_FOUND" | "INVALID_REFRESH_TOKEN" | "INVALID_ID_TOKEN"),
        ) => IdentityError::Rejected { code: c.to_owned(), message: body.to_owned() },
        Some("TOO_MANY_ATTEMPTS_TRY_LATER") => IdentityError::Network(format!("{status}: rate limited")),
        _ if status == 429 || status >= 500 => IdentityError::Network(format!("{status}: {body}")),
        Some(c) => IdentityError::Provider(format!("{status}: {c}")),
        None => IdentityError::Provider(format!("{status}: {body}")),
    }
}

#[cfg(test)]
#[path = "rest_test.rs"]
mod tests;
