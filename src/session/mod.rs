//! Session reconciliation: the single owner of session state.
//!
//! ARCHITECTURE
//! ============
//! `reconciler` holds the operations (restore, login, register, sign-out,
//! anonymous flows); `listener` applies the provider's asynchronous
//! auth-state notifications once the first restore has settled; `state`
//! defines the read-only view consumers subscribe to.

pub mod config;
mod listener;
pub mod reconciler;
pub mod state;

pub use config::{ProviderSignOutPolicy, ReconcilerConfig};
pub use reconciler::{Collaborators, SessionError, SessionReconciler};
pub use state::{EmailStatus, NavigationTarget, SessionPhase, SessionState, route_guard};
