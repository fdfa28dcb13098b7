//! Authoritative session state and the values consumers react to.
//!
//! SYSTEM CONTEXT
//! ==============
//! Screens and route guards hold a `watch::Receiver<SessionState>`; only the
//! reconciler mutates it. Navigation targets are emitted as events because
//! the actual screen transition belongs to the router.

use serde::Serialize;

use crate::identity::UserHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Process just started; nothing has been reconciled.
    Uninitialized,
    /// First restore pass in progress.
    Restoring,
    Authenticated,
    Anonymous,
    SignedOut,
}

impl SessionPhase {
    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Authenticated | Self::Anonymous | Self::SignedOut)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub phase: SessionPhase,
    /// `None` means signed out.
    pub current_user: Option<UserHandle>,
    pub is_anonymous: bool,
    /// Onboarding still pending for this user.
    ///
    /// When restore finds a live provider user it skips the profile store, so
    /// the flag is provisional until the listener's first profile fetch.
    pub is_new_user: bool,
    /// True until the first reconciliation pass completes.
    pub loading: bool,
    pub session_restore_attempted: bool,
    /// Raised briefly after an anonymous account becomes permanent.
    pub registration_completed: bool,
}

impl SessionState {
    #[must_use]
    pub fn initial() -> Self {
        Self {
            phase: SessionPhase::Uninitialized,
            current_user: None,
            is_anonymous: false,
            is_new_user: false,
            loading: true,
            session_restore_attempted: false,
            registration_completed: false,
        }
    }

    #[must_use]
    pub fn is_signed_in(&self) -> bool {
        self.current_user.is_some()
    }

    pub(crate) fn settle_authenticated(&mut self, user: UserHandle, is_new_user: bool) {
        self.phase = SessionPhase::Authenticated;
        self.current_user = Some(user);
        self.is_anonymous = false;
        self.is_new_user = is_new_user;
        self.loading = false;
    }

    pub(crate) fn settle_anonymous(&mut self, user: UserHandle) {
        self.phase = SessionPhase::Anonymous;
        self.current_user = Some(user);
        self.is_anonymous = true;
        self.is_new_user = true;
        self.loading = false;
    }

    pub(crate) fn settle_signed_out(&mut self) {
        self.phase = SessionPhase::SignedOut;
        self.current_user = None;
        self.is_anonymous = false;
        self.is_new_user = false;
        self.loading = false;
        self.registration_completed = false;
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::initial()
    }
}

/// Screen the router should show after a session operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationTarget {
    Onboarding,
    Main,
    Login,
}

impl NavigationTarget {
    #[must_use]
    pub fn after_sign_in(onboarding_completed: bool) -> Self {
        if onboarding_completed { Self::Main } else { Self::Onboarding }
    }
}

/// Where a route guard should send the user, or `None` to stay put.
///
/// Nothing redirects while the first restore is still loading.
#[must_use]
pub fn route_guard(state: &SessionState) -> Option<NavigationTarget> {
    if state.loading {
        return None;
    }
    match state.phase {
        SessionPhase::SignedOut => Some(NavigationTarget::Login),
        SessionPhase::Authenticated if state.is_new_user => Some(NavigationTarget::Onboarding),
        _ => None,
    }
}

/// Result of `check_email_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EmailStatus {
    pub exists: bool,
    pub onboarding_completed: bool,
}

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
