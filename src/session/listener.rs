//! Auth-state listener: applies provider notifications after first restore.
//!
//! DESIGN
//! ======
//! The task holds only a `Weak<Inner>`: dropping the last reconciler handle
//! ends it, and `Inner::drop` aborts it as well. The current value of the
//! watch channel is processed first, then every change.
//!
//! A non-anonymous notification is resolved (token, profile) outside the
//! writes lock and committed inside it. If the provider no longer holds that
//! uid, or the session epoch moved in between (sign-out, or a login that
//! failed and abandoned its provider session), the notification is stale and
//! dropped.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::config::ProviderSignOutPolicy;
use super::reconciler::{Inner, SessionError, SessionReconciler};
use crate::identity::UserHandle;
use crate::record::{AuthToken, SessionRecord};

pub(super) async fn run(weak: Weak<Inner>, mut rx: watch::Receiver<Option<UserHandle>>) {
    loop {
        let notification = rx.borrow_and_update().clone();
        let Some(inner) = weak.upgrade() else {
            return;
        };
        apply(&SessionReconciler::from_inner(inner), notification).await;

        if rx.changed().await.is_err() {
            debug!("auth-state stream closed; listener exiting");
            return;
        }
    }
}

async fn apply(reconciler: &SessionReconciler, notification: Option<UserHandle>) {
    match notification {
        Some(user) if user.is_anonymous => {
            let state = reconciler.state();
            let unchanged = state.is_anonymous && state.current_user.as_ref().is_some_and(|u| u.uid == user.uid);
            if !unchanged {
                reconciler.settle_anonymous(user);
            }
        }
        Some(user) => {
            let uid = user.uid.clone();
            if let Err(e) = apply_signed_in(reconciler, user).await {
                warn!(uid, error = %e, "failed to apply provider sign-in notification");
            }
        }
        None => apply_signed_out(reconciler).await,
    }
}

async fn apply_signed_in(reconciler: &SessionReconciler, user: UserHandle) -> Result<(), SessionError> {
    let inner: &Arc<Inner> = &reconciler.inner;
    let epoch = inner.session_epoch.load(Ordering::SeqCst);
    let token = AuthToken::new(inner.deps.identity.get_id_token(&user).await?);
    let profile_onboarding = reconciler.fetch_onboarding(&user.uid).await;

    let _writes = inner.writes.lock().await;
    // Provider moved on while this notification was being resolved.
    if inner.deps.identity.current_user().is_none_or(|live| live.uid != user.uid) {
        debug!(uid = %user.uid, "dropping stale provider notification");
        return Ok(());
    }
    // A sign-out or abandoned sign-in ran while this was being resolved.
    if inner.session_epoch.load(Ordering::SeqCst) != epoch {
        debug!(uid = %user.uid, "dropping notification superseded by session teardown");
        return Ok(());
    }

    inner.deps.credentials.save_auth_token(&token).await?;
    let existing = inner.deps.credentials.get_user_data().await?;
    let onboarding = profile_onboarding
        .or_else(|| {
            existing
                .as_ref()
                .filter(|r| r.user_id == user.uid)
                .map(|r| r.onboarding_completed)
        })
        .unwrap_or(false);
    let record = SessionRecord::merge_from_provider(existing.as_ref(), &user, onboarding);
    inner.deps.credentials.save_user_data(&record).await?;

    info!(uid = %user.uid, onboarding, "applied provider sign-in notification");
    reconciler.settle_authenticated(user, !onboarding);
    Ok(())
}

async fn apply_signed_out(reconciler: &SessionReconciler) {
    match reconciler.inner.config.provider_sign_out {
        ProviderSignOutPolicy::Ignore => {
            debug!("provider reported no user; local session unchanged");
        }
        ProviderSignOutPolicy::ClearSession => {
            let _writes = reconciler.inner.writes.lock().await;
            if reconciler.state().is_signed_in() {
                info!("provider session ended; clearing local session");
                reconciler.clear_credentials().await;
                reconciler.settle_signed_out();
            }
        }
    }
}

#[cfg(test)]
#[path = "listener_test.rs"]
mod tests;
