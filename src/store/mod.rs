//! Credential store contract: durable on-device session persistence.
//!
//! SYSTEM CONTEXT
//! ==============
//! Only the session reconciler reads or writes these entries. Every write is
//! all-or-nothing: either the full new value lands or the previous value
//! remains. An empty store (first run) reads as `None`, never as an error.

pub mod encrypted;

pub use encrypted::EncryptedFileStore;

use serde_json::Value;

use crate::record::{AuthToken, SessionRecord};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("credential store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential store entry `{0}` is unreadable")]
    Corrupt(&'static str),
    #[error("credential store serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("anonymous sessions are never persisted")]
    AnonymousRecord,
}

#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    async fn save_user_data(&self, record: &SessionRecord) -> Result<(), StoreError>;

    async fn get_user_data(&self) -> Result<Option<SessionRecord>, StoreError>;

    async fn remove_user_data(&self) -> Result<(), StoreError>;

    async fn save_auth_token(&self, token: &AuthToken) -> Result<(), StoreError>;

    async fn get_auth_token(&self) -> Result<Option<AuthToken>, StoreError>;

    async fn remove_auth_token(&self) -> Result<(), StoreError>;
}

/// Local holding area for data collected during an anonymous session.
#[async_trait::async_trait]
pub trait StagingArea: Send + Sync {
    async fn stage(&self, data: &Value) -> Result<(), StoreError>;

    async fn read_staged(&self) -> Result<Option<Value>, StoreError>;

    async fn clear_staged(&self) -> Result<(), StoreError>;
}
