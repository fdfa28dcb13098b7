//! Session and identity reconciliation for the fitness tracking app.
//!
//! ARCHITECTURE
//! ============
//! The [`session::SessionReconciler`] is the single writer of session state.
//! It depends on three injected collaborators:
//! - [`identity::IdentityProvider`]: remote auth service (sign-in, tokens,
//!   auth-state notifications).
//! - [`profile::ProfileStore`]: remote per-user profile documents.
//! - [`store::CredentialStore`] + [`store::StagingArea`]: encrypted on-device
//!   persistence used to restore a session across process restarts.
//!
//! Screens and navigation consume a read-only `watch` view of
//! [`session::SessionState`] plus [`session::NavigationTarget`] events; they
//! never touch the stores or the provider directly.

pub mod commands;
pub mod config;
pub mod identity;
pub mod profile;
pub mod record;
pub mod session;
pub mod store;
pub mod watchers;

#[cfg(test)]
pub mod test_helpers;
