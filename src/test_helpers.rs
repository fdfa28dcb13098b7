//! In-memory fakes for the reconciler's collaborators.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Notify, watch};

use crate::identity::{IdentityError, IdentityProvider, UserHandle};
use crate::profile::{ProfileError, ProfileStore};
use crate::record::{AuthToken, ProfileDocument, SessionRecord};
use crate::session::{Collaborators, ReconcilerConfig, SessionReconciler};
use crate::store::{CredentialStore, StagingArea, StoreError};

pub const COLLECTION: &str = "users";

/// Reconciler config with no warm-up and short bounds.
#[must_use]
pub fn test_config() -> ReconcilerConfig {
    ReconcilerConfig {
        profile_collection: COLLECTION.to_owned(),
        provider_warmup: Duration::ZERO,
        restore_timeout: Duration::from_secs(2),
        restore_retries: 3,
        restore_retry_base: Duration::from_millis(1),
        registration_pulse: Duration::from_millis(30),
        ..ReconcilerConfig::default()
    }
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

// =============================================================================
// IDENTITY PROVIDER
// =============================================================================

struct Account {
    password: String,
    user: UserHandle,
}

pub struct FakeIdentityProvider {
    accounts: Mutex<HashMap<String, Account>>,
    current: watch::Sender<Option<UserHandle>>,
    calls: Mutex<Vec<&'static str>>,
    sign_in_errors: Mutex<VecDeque<IdentityError>>,
    sign_in_gate: Mutex<Option<Arc<Notify>>>,
    hang_sign_in: AtomicBool,
    fail_sign_out: AtomicBool,
    fail_token: AtomicBool,
    next_id: AtomicUsize,
}

impl FakeIdentityProvider {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            accounts: Mutex::default(),
            current: watch::channel(None).0,
            calls: Mutex::default(),
            sign_in_errors: Mutex::default(),
            sign_in_gate: Mutex::default(),
            hang_sign_in: AtomicBool::new(false),
            fail_sign_out: AtomicBool::new(false),
            fail_token: AtomicBool::new(false),
            next_id: AtomicUsize::new(0),
        })
    }

    pub fn add_account(&self, email: &str, password: &str, uid: &str) -> UserHandle {
        let user = UserHandle {
            uid: uid.to_owned(),
            email: Some(email.to_owned()),
            display_name: None,
            is_anonymous: false,
        };
        self.accounts
            .lock()
            .unwrap()
            .insert(email.to_owned(), Account { password: password.to_owned(), user: user.clone() });
        user
    }

    /// Copy accounts into a fresh provider with no live user, as after a restart.
    #[must_use]
    pub fn restarted(&self) -> Arc<Self> {
        let fresh = Self::new();
        for (email, account) in self.accounts.lock().unwrap().iter() {
            fresh.accounts.lock().unwrap().insert(
                email.clone(),
                Account { password: account.password.clone(), user: account.user.clone() },
            );
        }
        fresh.next_id.store(self.next_id.load(Ordering::SeqCst), Ordering::SeqCst);
        fresh
    }

    /// Simulate a provider-side auth-state change.
    pub fn emit(&self, user: Option<UserHandle>) {
        self.current.send_replace(user);
    }

    pub fn push_sign_in_error(&self, error: IdentityError) {
        self.sign_in_errors.lock().unwrap().push_back(error);
    }

    /// Block sign-in until the returned `Notify` is signalled.
    pub fn gate_sign_in(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.sign_in_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn hang_sign_in(&self) {
        self.hang_sign_in.store(true, Ordering::SeqCst);
    }

    pub fn fail_sign_out(&self) {
        self.fail_sign_out.store(true, Ordering::SeqCst);
    }

    pub fn fail_token(&self) {
        self.fail_token.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    #[must_use]
    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_uid(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait::async_trait]
impl IdentityProvider for FakeIdentityProvider {
    async fn sign_in_with_email(&self, email: &str, password: &str) -> Result<UserHandle, IdentityError> {
        self.record("sign_in_with_email");
        let gate = self.sign_in_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.hang_sign_in.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let queued = self.sign_in_errors.lock().unwrap().pop_front();
        if let Some(e) = queued {
            return Err(e);
        }
        let user = {
            let accounts = self.accounts.lock().unwrap();
            match accounts.get(email) {
                Some(account) if account.password == password => account.user.clone(),
                _ => return Err(IdentityError::InvalidCredential),
            }
        };
        self.emit(Some(user.clone()));
        Ok(user)
    }

    async fn create_user(&self, email: &str, password: &str) -> Result<UserHandle, IdentityError> {
        self.record("create_user");
        if self.accounts.lock().unwrap().contains_key(email) {
            return Err(IdentityError::EmailAlreadyInUse);
        }
        let user = self.add_account(email, password, &self.next_uid("uid"));
        self.emit(Some(user.clone()));
        Ok(user)
    }

    async fn sign_in_anonymously(&self) -> Result<UserHandle, IdentityError> {
        self.record("sign_in_anonymously");
        let user = UserHandle {
            uid: self.next_uid("anon"),
            email: None,
            display_name: None,
            is_anonymous: true,
        };
        self.emit(Some(user.clone()));
        Ok(user)
    }

    async fn sign_out(&self) -> Result<(), IdentityError> {
        self.record("sign_out");
        if self.fail_sign_out.load(Ordering::SeqCst) {
            return Err(IdentityError::Network("offline".into()));
        }
        self.emit(None);
        Ok(())
    }

    async fn get_id_token(&self, user: &UserHandle) -> Result<String, IdentityError> {
        self.record("get_id_token");
        if self.fail_token.load(Ordering::SeqCst) {
            return Err(IdentityError::Network("token endpoint down".into()));
        }
        Ok(format!("token-{}", user.uid))
    }

    async fn fetch_sign_in_methods(&self, email: &str) -> Result<Vec<String>, IdentityError> {
        self.record("fetch_sign_in_methods");
        if self.accounts.lock().unwrap().contains_key(email) {
            Ok(vec!["password".to_owned()])
        } else {
            Ok(Vec::new())
        }
    }

    async fn update_profile(&self, user: &UserHandle, display_name: &str) -> Result<UserHandle, IdentityError> {
        self.record("update_profile");
        let mut updated = user.clone();
        updated.display_name = Some(display_name.to_owned());
        if let Some(email) = &user.email {
            if let Some(account) = self.accounts.lock().unwrap().get_mut(email) {
                account.user = updated.clone();
            }
        }
        self.current.send_if_modified(|current| match current {
            Some(live) if live.uid == updated.uid => {
                *live = updated.clone();
                true
            }
            _ => false,
        });
        Ok(updated)
    }

    fn current_user(&self) -> Option<UserHandle> {
        self.current.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<UserHandle>> {
        self.record("subscribe");
        self.current.subscribe()
    }
}

// =============================================================================
// CREDENTIAL STORE
// =============================================================================

#[derive(Default)]
pub struct MemoryCredentialStore {
    record: Mutex<Option<SessionRecord>>,
    token: Mutex<Option<AuthToken>>,
    staged: Mutex<Option<Value>>,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    pub removes: AtomicUsize,
    corrupt_record: AtomicBool,
    fail_token_save: AtomicBool,
    fail_removes: AtomicBool,
}

impl MemoryCredentialStore {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, record: SessionRecord, token: Option<&str>) {
        *self.record.lock().unwrap() = Some(record);
        *self.token.lock().unwrap() = token.map(AuthToken::new);
    }

    #[must_use]
    pub fn record(&self) -> Option<SessionRecord> {
        self.record.lock().unwrap().clone()
    }

    #[must_use]
    pub fn token(&self) -> Option<AuthToken> {
        self.token.lock().unwrap().clone()
    }

    #[must_use]
    pub fn staged(&self) -> Option<Value> {
        self.staged.lock().unwrap().clone()
    }

    pub fn corrupt_record(&self) {
        self.corrupt_record.store(true, Ordering::SeqCst);
    }

    pub fn fail_token_save(&self) {
        self.fail_token_save.store(true, Ordering::SeqCst);
    }

    pub fn fail_removes(&self) {
        self.fail_removes.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn touches(&self) -> usize {
        self.reads.load(Ordering::SeqCst) + self.writes.load(Ordering::SeqCst) + self.removes.load(Ordering::SeqCst)
    }

    fn remove_failure(&self) -> Result<(), StoreError> {
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("keystore locked")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn save_user_data(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if record.is_anonymous {
            return Err(StoreError::AnonymousRecord);
        }
        *self.record.lock().unwrap() = Some(record.clone());
        Ok(())
    }

    async fn get_user_data(&self) -> Result<Option<SessionRecord>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.corrupt_record.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt("session_record"));
        }
        Ok(self.record())
    }

    async fn remove_user_data(&self) -> Result<(), StoreError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.remove_failure()?;
        *self.record.lock().unwrap() = None;
        Ok(())
    }

    async fn save_auth_token(&self, token: &AuthToken) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_token_save.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        *self.token.lock().unwrap() = Some(token.clone());
        Ok(())
    }

    async fn get_auth_token(&self) -> Result<Option<AuthToken>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.token())
    }

    async fn remove_auth_token(&self) -> Result<(), StoreError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.remove_failure()?;
        *self.token.lock().unwrap() = None;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StagingArea for MemoryCredentialStore {
    async fn stage(&self, data: &Value) -> Result<(), StoreError> {
        *self.staged.lock().unwrap() = Some(data.clone());
        Ok(())
    }

    async fn read_staged(&self) -> Result<Option<Value>, StoreError> {
        Ok(self.staged())
    }

    async fn clear_staged(&self) -> Result<(), StoreError> {
        *self.staged.lock().unwrap() = None;
        Ok(())
    }
}

// =============================================================================
// PROFILE STORE
// =============================================================================

#[derive(Default)]
pub struct MemoryProfileStore {
    docs: Mutex<HashMap<(String, String), ProfileDocument>>,
    fail_get: AtomicBool,
    hang_get: AtomicBool,
    /// Delay applied to the next `get_document` only.
    slow_get: Mutex<Option<Duration>>,
    pub sets: AtomicUsize,
}

impl MemoryProfileStore {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, id: &str, doc: ProfileDocument) {
        self.docs
            .lock()
            .unwrap()
            .insert((COLLECTION.to_owned(), id.to_owned()), doc);
    }

    #[must_use]
    pub fn doc(&self, id: &str) -> Option<ProfileDocument> {
        self.docs
            .lock()
            .unwrap()
            .get(&(COLLECTION.to_owned(), id.to_owned()))
            .cloned()
    }

    pub fn set_onboarding(&self, id: &str, done: bool) {
        if let Some(doc) = self
            .docs
            .lock()
            .unwrap()
            .get_mut(&(COLLECTION.to_owned(), id.to_owned()))
        {
            doc.onboarding_completed = done;
        }
    }

    pub fn fail_get(&self, fail: bool) {
        self.fail_get.store(fail, Ordering::SeqCst);
    }

    /// Every `get_document` never returns.
    pub fn hang_get(&self) {
        self.hang_get.store(true, Ordering::SeqCst);
    }

    /// Stall the next `get_document` before it answers.
    pub fn slow_next_get(&self, delay: Duration) {
        *self.slow_get.lock().unwrap() = Some(delay);
    }
}

#[async_trait::async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<ProfileDocument>, ProfileError> {
        if self.hang_get.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let delay = self.slow_get.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(ProfileError::Request("connection reset".into()));
        }
        Ok(self
            .docs
            .lock()
            .unwrap()
            .get(&(collection.to_owned(), id.to_owned()))
            .cloned())
    }

    async fn set_document(&self, collection: &str, id: &str, doc: &ProfileDocument) -> Result<(), ProfileError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.docs
            .lock()
            .unwrap()
            .insert((collection.to_owned(), id.to_owned()), doc.clone());
        Ok(())
    }

    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<ProfileDocument>, ProfileError> {
        Ok(self
            .docs
            .lock()
            .unwrap()
            .iter()
            .find(|((c, _), doc)| c == collection && doc.extra.get(field).and_then(Value::as_str) == Some(value))
            .map(|(_, doc)| doc.clone()))
    }
}

// =============================================================================
// HARNESS
// =============================================================================

pub struct Harness {
    pub identity: Arc<FakeIdentityProvider>,
    pub profiles: Arc<MemoryProfileStore>,
    pub store: Arc<MemoryCredentialStore>,
    pub reconciler: SessionReconciler,
}

impl Harness {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    #[must_use]
    pub fn with_config(config: ReconcilerConfig) -> Self {
        Self::assemble(FakeIdentityProvider::new(), MemoryProfileStore::new(), MemoryCredentialStore::new(), config)
    }

    #[must_use]
    pub fn assemble(
        identity: Arc<FakeIdentityProvider>,
        profiles: Arc<MemoryProfileStore>,
        store: Arc<MemoryCredentialStore>,
        config: ReconcilerConfig,
    ) -> Self {
        let reconciler = SessionReconciler::new(
            Collaborators {
                identity: identity.clone(),
                profiles: profiles.clone(),
                credentials: store.clone(),
                staging: store.clone(),
            },
            config,
        );
        Self { identity, profiles, store, reconciler }
    }

    /// Same device storage and backend accounts, fresh process.
    #[must_use]
    pub fn restart(&self) -> Self {
        Self::assemble(self.identity.restarted(), self.profiles.clone(), self.store.clone(), test_config())
    }
}
