//! Encrypted file-backed credential store.
//!
//! DESIGN
//! ======
//! Each entry is one file: a random 12-byte nonce followed by the AES-256-GCM
//! ciphertext of its JSON encoding. The key is the SHA-256 of a configured
//! passphrase. Writes go to a sibling temp file that is renamed over the
//! target, so a crash mid-write leaves the previous value intact. A single
//! async mutex serializes writers.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{CredentialStore, StagingArea, StoreError};
use crate::config::StoreConfig;
use crate::record::{AuthToken, SessionRecord};

const NONCE_LEN: usize = 12;

const USER_DATA_ENTRY: &str = "session_record";
const AUTH_TOKEN_ENTRY: &str = "auth_token";
const STAGED_PROFILE_ENTRY: &str = "staged_profile";

pub struct EncryptedFileStore {
    dir: PathBuf,
    cipher: Aes256Gcm,
    write_lock: Mutex<()>,
}

impl EncryptedFileStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        Self { dir: dir.into(), cipher, write_lock: Mutex::new(()) }
    }

    #[must_use]
    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.dir.clone(), &config.passphrase)
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, entry: &str) -> PathBuf {
        self.dir.join(format!("{entry}.bin"))
    }

    pub(crate) fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::rng().random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| StoreError::Corrupt("encrypt"))?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub(crate) fn open(&self, entry: &'static str, sealed: &[u8]) -> Result<Vec<u8>, StoreError> {
        if sealed.len() <= NONCE_LEN {
            return Err(StoreError::Corrupt(entry));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StoreError::Corrupt(entry))
    }

    async fn write_entry<T: Serialize + Sync>(&self, entry: &'static str, value: &T) -> Result<(), StoreError> {
        let plaintext = serde_json::to_vec(value)?;
        let sealed = self.seal(&plaintext)?;

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let target = self.entry_path(entry);
        let tmp = self.dir.join(format!(".{entry}.tmp"));
        tokio::fs::write(&tmp, &sealed).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                warn!(entry, error = %cleanup, "failed to remove temp credential file");
            }
            return Err(e.into());
        }
        debug!(entry, "credential store entry written");
        Ok(())
    }

    async fn read_entry<T: DeserializeOwned>(&self, entry: &'static str) -> Result<Option<T>, StoreError> {
        let sealed = match tokio::fs::read(self.entry_path(entry)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let plaintext = self.open(entry, &sealed)?;
        match serde_json::from_slice(&plaintext) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(entry, error = %e, "credential store entry has unexpected shape");
                Err(StoreError::Corrupt(entry))
            }
        }
    }

    async fn remove_entry(&self, entry: &'static str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.entry_path(entry)).await {
            Ok(()) => {
                debug!(entry, "credential store entry removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl CredentialStore for EncryptedFileStore {
    async fn save_user_data(&self, record: &SessionRecord) -> Result<(), StoreError> {
        if record.is_anonymous {
            return Err(StoreError::AnonymousRecord);
        }
        self.write_entry(USER_DATA_ENTRY, record).await
    }

    async fn get_user_data(&self) -> Result<Option<SessionRecord>, StoreError> {
        self.read_entry(USER_DATA_ENTRY).await
    }

    async fn remove_user_data(&self) -> Result<(), StoreError> {
        self.remove_entry(USER_DATA_ENTRY).await
    }

    async fn save_auth_token(&self, token: &AuthToken) -> Result<(), StoreError> {
        self.write_entry(AUTH_TOKEN_ENTRY, token).await
    }

    async fn get_auth_token(&self) -> Result<Option<AuthToken>, StoreError> {
        self.read_entry(AUTH_TOKEN_ENTRY).await
    }

    async fn remove_auth_token(&self) -> Result<(), StoreError> {
        self.remove_entry(AUTH_TOKEN_ENTRY).await
    }
}

#[async_trait::async_trait]
impl StagingArea for EncryptedFileStore {
    async fn stage(&self, data: &Value) -> Result<(), StoreError> {
        self.write_entry(STAGED_PROFILE_ENTRY, data).await
    }

    async fn read_staged(&self) -> Result<Option<Value>, StoreError> {
        self.read_entry(STAGED_PROFILE_ENTRY).await
    }

    async fn clear_staged(&self) -> Result<(), StoreError> {
        self.remove_entry(STAGED_PROFILE_ENTRY).await
    }
}

#[cfg(test)]
#[path = "encrypted_test.rs"]
mod tests;
