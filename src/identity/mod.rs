//! Identity provider contract: sign-in, tokens and auth-state notifications.
//!
//! DESIGN
//! ======
//! The provider is injected into the reconciler as `Arc<dyn IdentityProvider>`
//! so tests can substitute a fake. Auth-state changes are published on a
//! `watch` channel: a new subscriber sees the current user immediately, which
//! gives the "fires at least once at startup" contract for free.

pub mod rest;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

pub use rest::{IdentityConfig, RestIdentityProvider};

/// Opaque handle for the provider's current user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserHandle {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub is_anonymous: bool,
}

// =============================================================================
// ERROR
// =============================================================================

/// Errors produced by identity provider operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// Email/password pair was not accepted.
    #[error("invalid email or password")]
    InvalidCredential,

    /// An account already exists for the email.
    #[error("email already in use")]
    EmailAlreadyInUse,

    /// Transport failure or a retryable server status.
    #[error("identity provider unreachable: {0}")]
    Network(String),

    /// The provider refused the account or token (disabled, expired, revoked).
    #[error("identity provider rejected request: {code}")]
    Rejected { code: String, message: String },

    /// Any other provider failure.
    #[error("identity provider error: {0}")]
    Provider(String),
}

impl IdentityError {
    /// Worth retrying with the same input.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// The credential itself is bad; retrying will not help.
    #[must_use]
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::InvalidCredential | Self::Rejected { .. })
    }
}

// =============================================================================
// PROVIDER TRAIT
// =============================================================================

#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in_with_email(&self, email: &str, password: &str) -> Result<UserHandle, IdentityError>;

    async fn create_user(&self, email: &str, password: &str) -> Result<UserHandle, IdentityError>;

    async fn sign_in_anonymously(&self) -> Result<UserHandle, IdentityError>;

    async fn sign_out(&self) -> Result<(), IdentityError>;

    async fn get_id_token(&self, user: &UserHandle) -> Result<String, IdentityError>;

    /// Sign-in methods registered for `email`. Empty means the email is unused.
    async fn fetch_sign_in_methods(&self, email: &str) -> Result<Vec<String>, IdentityError>;

    async fn update_profile(&self, user: &UserHandle, display_name: &str) -> Result<UserHandle, IdentityError>;

    /// Live user, if the provider currently holds a session.
    fn current_user(&self) -> Option<UserHandle>;

    /// Auth-state change stream. The receiver starts at the current value.
    fn subscribe(&self) -> watch::Receiver<Option<UserHandle>>;
}
