//! Background tasks that drive the reconciler from outside events.
//!
//! SYSTEM CONTEXT
//! ==============
//! Connectivity and foreground events arrive from the host platform on an
//! mpsc channel. Each one re-triggers `restore_session()` while the session
//! is signed out; the reconciler's in-flight guard collapses bursts into one
//! provider sign-in.

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::session::{SessionPhase, SessionReconciler, SessionState};

/// Host lifecycle signal that may make a failed restore worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    ConnectivityRestored,
    Foregrounded,
}

/// Spawn the lifecycle watcher. Ends when the event sender is dropped.
pub fn spawn_lifecycle_watcher(
    reconciler: SessionReconciler,
    mut events: mpsc::Receiver<LifecycleEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let state = reconciler.state();
            if state.phase != SessionPhase::SignedOut {
                debug!(?event, phase = ?state.phase, "lifecycle event ignored");
                continue;
            }
            info!(?event, "lifecycle event; retrying session restore");
            let r = reconciler.clone();
            tokio::spawn(async move {
                let restored = r.restore_session().await;
                debug!(restored, "lifecycle-triggered restore finished");
            });
        }
        debug!("lifecycle event stream closed");
    })
}

/// Log every session state transition. Ends when the reconciler is dropped.
pub fn spawn_state_logger(mut rx: watch::Receiver<SessionState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let state = rx.borrow_and_update().clone();
            info!(
                phase = ?state.phase,
                uid = state.current_user.as_ref().map(|u| u.uid.as_str()),
                is_new_user = state.is_new_user,
                loading = state.loading,
                "session state changed"
            );
        }
    })
}

#[cfg(test)]
#[path = "watchers_test.rs"]
mod tests;
