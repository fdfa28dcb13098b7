//! Session reconciler: restore and mutate the published session.
//!
//! DESIGN
//! ======
//! `SessionReconciler` is a cheap `Clone` handle over `Arc<Inner>`. State is
//! published through a `watch` channel; navigation targets through a
//! `broadcast` channel. Collaborators are injected at construction.
//!
//! ORDERING
//! ========
//! - The live-update listener starts only after the first restore has applied
//!   its own state transition, so the provider's startup notification cannot
//!   race the manual restore.
//! - Concurrent `restore_session()` callers share one in-flight future.
//! - Store-mutating sections (restore commit, listener commit, sign-out) run
//!   under one async mutex so a late listener write can never resurrect a
//!   record that sign-out just deleted. Login, register and the anonymous
//!   upgrade hold it from the provider call through commit or rollback.
//! - Tearing a session down bumps `session_epoch`. Restore and listener
//!   commits that started under an older epoch are dropped.
//! - The restore timeout bounds only the resolve phase (store read, sign-in,
//!   token, profile). The commit runs to completion outside it.
//!
//! ERROR HANDLING
//! ==============
//! User-intent operations (login, register) return provider errors unchanged.
//! Restore and listener failures are logged and mapped to a signed-out state;
//! nobody is waiting on them synchronously.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::ReconcilerConfig;
use super::listener;
use super::state::{EmailStatus, NavigationTarget, SessionPhase, SessionState};
use crate::identity::{IdentityError, IdentityProvider, UserHandle};
use crate::profile::{ProfileError, ProfileStore};
use crate::record::{AuthToken, ProfileDocument, SessionRecord};
use crate::store::{CredentialStore, StagingArea, StoreError};

const NAVIGATION_CHANNEL_CAPACITY: usize = 16;

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Provider failure, passed through unchanged for the UI to present.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("an account with this email already exists")]
    EmailAlreadyRegistered,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Profile(#[from] ProfileError),
}

impl SessionError {
    /// A restore failure that proves the stored credential is unusable.
    fn discards_credential(&self) -> bool {
        match self {
            Self::Identity(e) => e.is_auth_rejection(),
            Self::Store(StoreError::Corrupt(_)) => true,
            _ => false,
        }
    }
}

fn normalize_conflict(e: IdentityError) -> SessionError {
    match e {
        IdentityError::EmailAlreadyInUse => SessionError::EmailAlreadyRegistered,
        other => SessionError::Identity(other),
    }
}

// =============================================================================
// RECONCILER
// =============================================================================

/// External services the reconciler depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityProvider>,
    pub profiles: Arc<dyn ProfileStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub staging: Arc<dyn StagingArea>,
}

type RestoreFlight = Shared<BoxFuture<'static, bool>>;

/// Stored credentials signed in and refreshed, not yet persisted.
struct ResolvedSession {
    user: UserHandle,
    token: AuthToken,
    record: SessionRecord,
    onboarding: bool,
}

pub(super) struct Inner {
    pub(super) deps: Collaborators,
    pub(super) config: ReconcilerConfig,
    state_tx: watch::Sender<SessionState>,
    nav_tx: broadcast::Sender<NavigationTarget>,
    restore_flight: Mutex<Option<RestoreFlight>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    /// Serializes store-mutating sections.
    pub(super) writes: tokio::sync::Mutex<()>,
    /// Bumped under `writes` whenever a session is torn down: explicit
    /// sign-out or a sign-in abandoned by a failed operation.
    pub(super) session_epoch: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let slot = self.listener.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

#[derive(Clone)]
pub struct SessionReconciler {
    pub(super) inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionReconciler {
    #[must_use]
    pub fn new(deps: Collaborators, config: ReconcilerConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::initial());
        let (nav_tx, _) = broadcast::channel(NAVIGATION_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                deps,
                config,
                state_tx,
                nav_tx,
                restore_flight: Mutex::new(None),
                listener: Mutex::new(None),
                writes: tokio::sync::Mutex::new(()),
                session_epoch: AtomicU64::new(0),
            }),
        }
    }

    pub(super) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub(super) fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    // =========================================================================
    // READ SIDE
    // =========================================================================

    /// Snapshot of the current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Reactive read-only view for screens and route guards.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Navigation targets emitted by session operations.
    #[must_use]
    pub fn subscribe_navigation(&self) -> broadcast::Receiver<NavigationTarget> {
        self.inner.nav_tx.subscribe()
    }

    /// True once the live-update listener has been started.
    #[must_use]
    pub fn listener_started(&self) -> bool {
        lock(&self.inner.listener).is_some()
    }

    // =========================================================================
    // STATE TRANSITIONS
    // =========================================================================

    pub(super) fn settle_authenticated(&self, user: UserHandle, is_new_user: bool) {
        info!(uid = %user.uid, is_new_user, "session authenticated");
        self.inner
            .state_tx
            .send_modify(|s| s.settle_authenticated(user, is_new_user));
    }

    pub(super) fn settle_anonymous(&self, user: UserHandle) {
        info!(uid = %user.uid, "anonymous session active");
        self.inner.state_tx.send_modify(|s| s.settle_anonymous(user));
    }

    pub(super) fn settle_signed_out(&self) {
        info!("session signed out");
        self.inner.state_tx.send_modify(SessionState::settle_signed_out);
    }

    fn navigate(&self, target: NavigationTarget) {
        debug!(?target, "navigation requested");
        // No subscribers is fine: the router may not be mounted yet.
        let _ = self.inner.nav_tx.send(target);
    }

    /// Onboarding flag from the profile document, `None` if absent or unreadable.
    pub(super) async fn fetch_onboarding(&self, uid: &str) -> Option<bool> {
        let deps = &self.inner.deps;
        match deps
            .profiles
            .get_document(&self.inner.config.profile_collection, uid)
            .await
        {
            Ok(doc) => doc.map(|d| d.onboarding_completed),
            Err(e) => {
                warn!(uid, error = %e, "profile fetch failed; using stored onboarding flag");
                None
            }
        }
    }

    /// Write record then token; a failed token write rolls the record back.
    async fn persist_session(&self, record: &SessionRecord, token: &AuthToken) -> Result<(), StoreError> {
        let credentials = &self.inner.deps.credentials;
        credentials.save_user_data(record).await?;
        if let Err(e) = credentials.save_auth_token(token).await {
            if let Err(rollback) = credentials.remove_user_data().await {
                error!(error = %rollback, "failed to roll back session record");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Tear down a provider sign-in left behind by a failed or superseded
    /// operation. Caller holds `writes`.
    ///
    /// Bumps the session epoch so listener commits already resolving `uid`
    /// are dropped. If the local session names `uid` it is cleared as well.
    async fn abandon_sign_in(&self, uid: &str) {
        self.inner.session_epoch.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.inner.deps.identity.sign_out().await {
            warn!(uid, error = %e, "failed to abandon provider session");
        }
        if self.state().current_user.is_some_and(|u| u.uid == uid) {
            info!(uid, "clearing local session for abandoned sign-in");
            self.clear_credentials().await;
            self.settle_signed_out();
        }
    }

    pub(super) async fn clear_credentials(&self) {
        let credentials = &self.inner.deps.credentials;
        if let Err(e) = credentials.remove_user_data().await {
            error!(error = %e, "failed to remove stored session record");
        }
        if let Err(e) = credentials.remove_auth_token().await {
            error!(error = %e, "failed to remove stored auth token");
        }
    }

    // =========================================================================
    // RESTORE
    // =========================================================================

    /// Reconcile with the provider and stored credentials.
    ///
    /// Returns `true` when a user session is live afterwards. Always leaves the
    /// state settled. Concurrent callers share one in-flight attempt.
    pub async fn restore_session(&self) -> bool {
        let flight = {
            let mut slot = lock(&self.inner.restore_flight);
            if let Some(existing) = slot.as_ref() {
                debug!("joining in-flight session restore");
                existing.clone()
            } else {
                let this = self.clone();
                let flight = async move {
                    let restored = this.restore_once().await;
                    *lock(&this.inner.restore_flight) = None;
                    this.start_listener();
                    restored
                }
                .boxed()
                .shared();
                *slot = Some(flight.clone());
                flight
            }
        };
        flight.await
    }

    async fn restore_once(&self) -> bool {
        self.inner.state_tx.send_modify(|s| {
            if s.phase == SessionPhase::Uninitialized {
                s.phase = SessionPhase::Restoring;
            }
            s.session_restore_attempted = true;
        });

        if let Some(user) = self.inner.deps.identity.current_user() {
            debug!(uid = %user.uid, "provider already has a live user; skipping stored credentials");
            if user.is_anonymous {
                self.settle_anonymous(user);
            } else {
                // Provisional; the listener's first profile fetch settles it.
                let state = self.state();
                let is_new_user = state.is_new_user && state.current_user.is_some_and(|u| u.uid == user.uid);
                self.settle_authenticated(user, is_new_user);
            }
            return true;
        }

        let epoch = self.inner.session_epoch.load(Ordering::SeqCst);
        let timeout = self.inner.config.restore_timeout;
        let outcome = match tokio::time::timeout(timeout, self.resolve_stored_session()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(?timeout, "session restore timed out; keeping stored credential for a later attempt");
                Ok(None)
            }
        };

        let _writes = self.inner.writes.lock().await;
        match outcome {
            Ok(Some(resolved)) => self.commit_restore(resolved, epoch).await,
            Ok(None) => self.settle_failed_restore(false).await,
            Err(e) => {
                let discard = e.discards_credential();
                if discard {
                    warn!(error = %e, "stored credential rejected; discarding");
                } else {
                    warn!(error = %e, "session restore failed; keeping stored credential for a later attempt");
                }
                self.settle_failed_restore(discard).await
            }
        }
    }

    /// Read stored credentials and sign them in. Writes neither the store
    /// nor the published state, so it is safe to cancel.
    async fn resolve_stored_session(&self) -> Result<Option<ResolvedSession>, SessionError> {
        let deps = &self.inner.deps;
        let record = deps.credentials.get_user_data().await?;
        let stored_token = deps.credentials.get_auth_token().await?;

        let Some(record) = record else {
            debug!("no stored session record");
            return Ok(None);
        };
        let (true, Some(email), Some(password)) =
            (record.has_credentials(), record.email.clone(), record.password.clone())
        else {
            debug!(uid = %record.user_id, "stored session record has no credentials");
            return Ok(None);
        };

        info!(uid = %record.user_id, has_token = stored_token.is_some(), "restoring session from stored credentials");
        let warmup = self.inner.config.provider_warmup;
        if !warmup.is_zero() {
            tokio::time::sleep(warmup).await;
        }

        let user = self.sign_in_with_retry(&email, &password).await?;
        let token = AuthToken::new(deps.identity.get_id_token(&user).await?);
        let onboarding = self
            .fetch_onboarding(&user.uid)
            .await
            .unwrap_or(record.onboarding_completed);

        let mut refreshed = SessionRecord::merge_from_provider(Some(&record), &user, onboarding);
        refreshed.password = Some(password);
        Ok(Some(ResolvedSession { user, token, record: refreshed, onboarding }))
    }

    /// Persist a resolved restore. Caller holds `writes`.
    async fn commit_restore(&self, resolved: ResolvedSession, epoch: u64) -> bool {
        let ResolvedSession { user, token, record, onboarding } = resolved;

        if self
            .inner
            .deps
            .identity
            .current_user()
            .is_none_or(|live| live.uid != user.uid)
        {
            debug!(uid = %user.uid, "provider moved on during restore; discarding restored session");
            return self.settle_failed_restore(false).await;
        }
        if self.inner.session_epoch.load(Ordering::SeqCst) != epoch {
            info!(uid = %user.uid, "session torn down during restore; discarding restored session");
            self.abandon_sign_in(&user.uid).await;
            return self.settle_failed_restore(false).await;
        }

        let credentials = &self.inner.deps.credentials;
        let saved = match credentials.save_user_data(&record).await {
            Ok(()) => credentials.save_auth_token(&token).await,
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            warn!(uid = %user.uid, error = %e, "failed to persist restored session");
            self.abandon_sign_in(&user.uid).await;
            return self.settle_failed_restore(false).await;
        }

        self.settle_authenticated(user, !onboarding);
        true
    }

    /// Settle a restore that produced no session. Caller holds `writes`.
    ///
    /// Leaves alone a session another operation settled meanwhile. Otherwise
    /// a provider sign-in the restore left live is abandoned.
    async fn settle_failed_restore(&self, discard_credential: bool) -> bool {
        if self.state().is_signed_in() {
            debug!("another operation settled the session during restore");
            return true;
        }
        if discard_credential {
            self.clear_credentials().await;
        }
        if let Some(live) = self.inner.deps.identity.current_user() {
            self.abandon_sign_in(&live.uid).await;
        }
        self.settle_signed_out();
        false
    }

    /// Sign in, retrying only while the provider is unreachable.
    async fn sign_in_with_retry(&self, email: &str, password: &str) -> Result<UserHandle, IdentityError> {
        let attempts = self.inner.config.restore_retries.max(1);
        let base = self.inner.config.restore_retry_base;
        let mut attempt = 1;
        loop {
            match self
                .inner
                .deps
                .identity
                .sign_in_with_email(email, password)
                .await
            {
                Ok(user) => return Ok(user),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(error = %e, attempt, total = attempts, "restore sign-in failed; retrying");
                    tokio::time::sleep(base.saturating_mul(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn start_listener(&self) {
        let mut slot = lock(&self.inner.listener);
        if slot.is_some() {
            return;
        }
        let rx = self.inner.deps.identity.subscribe();
        *slot = Some(tokio::spawn(listener::run(self.downgrade(), rx)));
        info!("auth-state listener started");
    }

    // =========================================================================
    // USER OPERATIONS
    // =========================================================================
    //
    // Each operation that signs a user in holds `writes` from the provider
    // call through commit or rollback, so the listener cannot persist a user
    // the operation is about to abandon.

    /// Sign in with email and password.
    ///
    /// # Errors
    ///
    /// Provider errors are returned unchanged. Nothing is persisted and the
    /// state is untouched on failure.
    pub async fn login(&self, email: &str, password: &str) -> Result<NavigationTarget, SessionError> {
        let deps = &self.inner.deps;
        let writes = self.inner.writes.lock().await;
        let user = deps.identity.sign_in_with_email(email, password).await?;

        let committed = async {
            let token = AuthToken::new(deps.identity.get_id_token(&user).await?);
            let onboarding = deps
                .profiles
                .get_document(&self.inner.config.profile_collection, &user.uid)
                .await?
                .is_some_and(|d| d.onboarding_completed);
            let record = SessionRecord::for_account(&user, Some(password), onboarding);

            self.persist_session(&record, &token).await?;
            self.settle_authenticated(user.clone(), !onboarding);
            Ok::<_, SessionError>(NavigationTarget::after_sign_in(onboarding))
        }
        .await;

        match committed {
            Ok(target) => {
                drop(writes);
                self.navigate(target);
                Ok(target)
            }
            Err(e) => {
                warn!(uid = %user.uid, error = %e, "login failed after provider sign-in; rolling back");
                self.abandon_sign_in(&user.uid).await;
                Err(e)
            }
        }
    }

    /// Create an email account and start onboarding.
    ///
    /// # Errors
    ///
    /// `EmailAlreadyRegistered` if the email has any sign-in method; other
    /// provider errors unchanged.
    pub async fn register(&self, name: &str, email: &str, password: &str) -> Result<NavigationTarget, SessionError> {
        let deps = &self.inner.deps;
        let methods = deps.identity.fetch_sign_in_methods(email).await?;
        if !methods.is_empty() {
            info!(methods = methods.len(), "registration refused; email already registered");
            return Err(SessionError::EmailAlreadyRegistered);
        }

        let writes = self.inner.writes.lock().await;
        let created = deps
            .identity
            .create_user(email, password)
            .await
            .map_err(normalize_conflict)?;

        let committed = async {
            let user = deps.identity.update_profile(&created, name).await?;
            let token = AuthToken::new(deps.identity.get_id_token(&user).await?);
            let doc = ProfileDocument::new_account(name, email, false);
            deps.profiles
                .set_document(&self.inner.config.profile_collection, &user.uid, &doc)
                .await?;
            let record = SessionRecord::for_account(&user, Some(password), false);

            self.persist_session(&record, &token).await?;
            self.settle_authenticated(user, true);
            Ok::<_, SessionError>(())
        }
        .await;

        if let Err(e) = committed {
            warn!(uid = %created.uid, error = %e, "registration failed after account creation");
            self.abandon_sign_in(&created.uid).await;
            return Err(e);
        }
        drop(writes);
        self.navigate(NavigationTarget::Onboarding);
        Ok(NavigationTarget::Onboarding)
    }

    /// Start an anonymous, memory-only session.
    ///
    /// # Errors
    ///
    /// Provider errors unchanged.
    pub async fn sign_in_anonymously(&self) -> Result<(), SessionError> {
        let user = self.inner.deps.identity.sign_in_anonymously().await?;
        self.settle_anonymous(user);
        Ok(())
    }

    /// Hold data collected during an anonymous session until it is migrated.
    ///
    /// # Errors
    ///
    /// Returns an error if the staging area cannot be written.
    pub async fn stage_anonymous_data(&self, data: &Value) -> Result<(), SessionError> {
        self.inner.deps.staging.stage(data).await?;
        Ok(())
    }

    /// Turn an anonymous session into a permanent account.
    ///
    /// A new provider identity is created; staged anonymous data is copied
    /// into its profile document. The anonymous uid is abandoned.
    ///
    /// # Errors
    ///
    /// `EmailAlreadyRegistered` on conflict, other provider errors unchanged.
    pub async fn complete_anonymous_registration(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> Result<NavigationTarget, SessionError> {
        let deps = &self.inner.deps;
        if !self.state().is_anonymous {
            warn!("completing anonymous registration without an anonymous session");
        }

        let staged = match deps.staging.read_staged().await {
            Ok(staged) => staged,
            Err(e) => {
                warn!(error = %e, "staged anonymous data unreadable; registering without it");
                None
            }
        };

        let writes = self.inner.writes.lock().await;
        let created = deps
            .identity
            .create_user(email, password)
            .await
            .map_err(normalize_conflict)?;

        let committed = async {
            let user = deps.identity.update_profile(&created, name).await?;
            let token = AuthToken::new(deps.identity.get_id_token(&user).await?);
            let doc = ProfileDocument::new_account(name, email, true).with_staged(staged.as_ref());
            deps.profiles
                .set_document(&self.inner.config.profile_collection, &user.uid, &doc)
                .await?;
            let record = SessionRecord::for_account(&user, Some(password), true);

            self.persist_session(&record, &token).await?;
            self.settle_authenticated(user, false);
            Ok::<_, SessionError>(())
        }
        .await;

        if let Err(e) = committed {
            warn!(uid = %created.uid, error = %e, "anonymous upgrade failed after account creation");
            self.abandon_sign_in(&created.uid).await;
            // The anonymous session was replaced by the abandoned account.
            self.settle_signed_out();
            return Err(e);
        }
        drop(writes);

        if let Err(e) = deps.staging.clear_staged().await {
            warn!(error = %e, "failed to clear staged anonymous data");
        }
        self.pulse_registration_completed();
        self.navigate(NavigationTarget::Main);
        Ok(NavigationTarget::Main)
    }

    fn pulse_registration_completed(&self) {
        self.inner
            .state_tx
            .send_modify(|s| s.registration_completed = true);
        let weak = self.downgrade();
        let pulse = self.inner.config.registration_pulse;
        tokio::spawn(async move {
            tokio::time::sleep(pulse).await;
            if let Some(inner) = weak.upgrade() {
                inner
                    .state_tx
                    .send_if_modified(|s| std::mem::replace(&mut s.registration_completed, false));
            }
        });
    }

    /// Sign out locally and at the provider.
    ///
    /// Local state is always cleared, even when the provider call fails.
    pub async fn sign_out(&self) {
        {
            let _writes = self.inner.writes.lock().await;
            self.inner.session_epoch.fetch_add(1, Ordering::SeqCst);
            self.clear_credentials().await;
            if let Err(e) = self.inner.deps.identity.sign_out().await {
                warn!(error = %e, "provider sign-out failed; clearing local session anyway");
            }
            self.settle_signed_out();
        }
        self.navigate(NavigationTarget::Login);
    }

    /// Whether an account exists for `email` and has finished onboarding.
    ///
    /// # Errors
    ///
    /// Provider or profile store errors.
    pub async fn check_email_status(&self, email: &str) -> Result<EmailStatus, SessionError> {
        let deps = &self.inner.deps;
        let methods = deps.identity.fetch_sign_in_methods(email).await?;
        if methods.is_empty() {
            return Ok(EmailStatus { exists: false, onboarding_completed: false });
        }
        let doc = deps
            .profiles
            .find_by_field(&self.inner.config.profile_collection, "email", email)
            .await?;
        Ok(EmailStatus { exists: true, onboarding_completed: doc.is_some_and(|d| d.onboarding_completed) })
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod tests;
