//! Profile document store contract: one onboarding/profile document per uid.

pub mod firestore;

pub use firestore::{FirestoreConfig, FirestoreProfileStore};

use crate::record::ProfileDocument;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("profile request failed: {0}")]
    Request(String),
    #[error("profile store returned status {status}")]
    Status { status: u16, body: String },
    #[error("profile document decode failed: {0}")]
    Decode(String),
}

#[async_trait::async_trait]
pub trait ProfileStore: Send + Sync {
    /// Fetch a document. `Ok(None)` when it does not exist.
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<ProfileDocument>, ProfileError>;

    /// Create or fully replace a document.
    async fn set_document(&self, collection: &str, id: &str, doc: &ProfileDocument) -> Result<(), ProfileError>;

    /// First document whose string `field` equals `value`.
    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Option<ProfileDocument>, ProfileError>;
}
