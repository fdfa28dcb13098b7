//! Persisted session shapes and the per-user profile document.
//!
//! DESIGN
//! ======
//! Field names serialize in camelCase so records written by earlier app
//! builds still parse. `ProfileDocument` keeps unknown fields in `extra`
//! so a read-modify-write never drops data other screens stored.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::UserHandle;

// =============================================================================
// SESSION RECORD
// =============================================================================

/// Last-known signed-in user, persisted so a session survives restarts.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Kept only for email accounts so the provider can be re-authenticated.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub onboarding_completed: bool,
    #[serde(default)]
    pub is_anonymous: bool,
}

impl SessionRecord {
    /// Build a record for a freshly authenticated email account.
    #[must_use]
    pub fn for_account(user: &UserHandle, password: Option<&str>, onboarding_completed: bool) -> Self {
        Self {
            user_id: user.uid.clone(),
            email: user.email.clone(),
            display_name: user.display_name.clone(),
            password: password.map(str::to_owned),
            onboarding_completed,
            is_anonymous: user.is_anonymous,
        }
    }

    /// Refresh a record from a provider user, keeping the stored password.
    ///
    /// The password survives only when `existing` belongs to the same uid;
    /// provider notifications never carry it.
    #[must_use]
    pub fn merge_from_provider(existing: Option<&Self>, user: &UserHandle, onboarding_completed: bool) -> Self {
        let password = existing
            .filter(|record| record.user_id == user.uid)
            .and_then(|record| record.password.clone());
        let display_name = user
            .display_name
            .clone()
            .or_else(|| existing.filter(|r| r.user_id == user.uid).and_then(|r| r.display_name.clone()));
        Self {
            user_id: user.uid.clone(),
            email: user.email.clone(),
            display_name,
            password,
            onboarding_completed,
            is_anonymous: user.is_anonymous,
        }
    }

    /// True when the record can re-authenticate: email and password are both set.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        filled(&self.email) && filled(&self.password)
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("user_id", &self.user_id)
            .field("email", &self.email)
            .field("display_name", &self.display_name)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("onboarding_completed", &self.onboarding_completed)
            .field("is_anonymous", &self.is_anonymous)
            .finish()
    }
}

// =============================================================================
// AUTH TOKEN
// =============================================================================

/// Opaque bearer token. Expiry is not tracked locally.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthToken(String);

impl AuthToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

// =============================================================================
// PROFILE DOCUMENT
// =============================================================================

/// App-specific profile stored outside the identity provider, one per uid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileDocument {
    #[serde(rename = "onboardingCompleted", default)]
    pub onboarding_completed: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProfileDocument {
    /// New-account document carrying the name and email entered at sign-up.
    #[must_use]
    pub fn new_account(name: &str, email: &str, onboarding_completed: bool) -> Self {
        let mut extra = Map::new();
        extra.insert("name".into(), Value::String(name.to_owned()));
        extra.insert("email".into(), Value::String(email.to_owned()));
        Self { onboarding_completed, extra }
    }

    /// Merge staged anonymous-session data underneath the account fields.
    ///
    /// Keys already on `self` win; `onboardingCompleted` in the staged blob is ignored.
    #[must_use]
    pub fn with_staged(mut self, staged: Option<&Value>) -> Self {
        let Some(Value::Object(staged)) = staged else {
            return self;
        };
        for (key, value) in staged {
            if key == "onboardingCompleted" {
                continue;
            }
            self.extra.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self
    }
}

#[cfg(test)]
#[path = "record_test.rs"]
mod tests;
