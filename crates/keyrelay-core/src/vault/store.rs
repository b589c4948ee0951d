//! Durable storage for encrypted provider secrets.
//!
//! The on-disk format is a JSON array of records:
//!
//! ```json
//! [
//!   {
//!     "provider": "openai",
//!     "encryptedKey": "9f1c...",
//!     "iv": "a3b4...",
//!     "createdAt": "2025-06-01T12:00:00Z",
//!     "expiresAt": "2025-07-01T12:00:00Z"
//!   }
//! ]
//! ```
//!
//! Stores always load and save the full record set. Writers replace the file
//! as a whole (temp file + rename), so a concurrent reader sees either the old
//! set or the new one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::VaultError;
use crate::cipher::IV_LEN;

/// One provider's encrypted secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSecret {
    /// Normalized (lower-case) provider name
    pub provider: String,

    /// AES-256-CBC ciphertext
    pub ciphertext: Vec<u8>,

    /// IV used to produce `ciphertext`
    pub iv: [u8; IV_LEN],

    /// When this record was written
    pub created_at: DateTime<Utc>,

    /// Optional expiry; expired records are ignored on read
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredSecret {
    /// Whether the record has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Serialized form of [`StoredSecret`] (hex bytes, ISO-8601 timestamps).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRecord {
    pub provider: String,
    pub encrypted_key: String,
    pub iv: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&StoredSecret> for KeyRecord {
    fn from(secret: &StoredSecret) -> Self {
        Self {
            provider: secret.provider.clone(),
            encrypted_key: hex::encode(&secret.ciphertext),
            iv: hex::encode(secret.iv),
            created_at: secret.created_at,
            expires_at: secret.expires_at,
        }
    }
}

impl TryFrom<KeyRecord> for StoredSecret {
    type Error = VaultError;

    fn try_from(record: KeyRecord) -> Result<Self, Self::Error> {
        let ciphertext = hex::decode(&record.encrypted_key).map_err(|e| {
            VaultError::InvalidRecord(format!("{}: bad encryptedKey hex: {}", record.provider, e))
        })?;
        let iv: [u8; IV_LEN] = hex::decode(&record.iv)
            .map_err(|e| {
                VaultError::InvalidRecord(format!("{}: bad iv hex: {}", record.provider, e))
            })?
            .try_into()
            .map_err(|bytes: Vec<u8>| {
                VaultError::InvalidRecord(format!(
                    "{}: iv must be {} bytes, got {}",
                    record.provider,
                    IV_LEN,
                    bytes.len()
                ))
            })?;

        Ok(Self {
            provider: record.provider,
            ciphertext,
            iv,
            created_at: record.created_at,
            expires_at: record.expires_at,
        })
    }
}

/// Durable backing store for the vault.
///
/// Implementations persist the complete record set on every `save`; they are
/// never asked to patch a single record in place.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Load every record.
    async fn load(&self) -> Result<Vec<StoredSecret>, VaultError>;

    /// Replace every record.
    async fn save(&self, records: &[StoredSecret]) -> Result<(), VaultError>;

    /// Store name for logs.
    fn name(&self) -> &str;
}

/// JSON-file key store.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    /// Create a store backed by `path`. The file is created on first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the file (as `[]`) and its parent directory if missing.
    async fn ensure_exists(&self) -> Result<(), VaultError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(mut file) => {
                file.write_all(b"[]").await?;
                file.flush().await?;
                tracing::debug!(path = %self.path.display(), "Created empty key store");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Directory holding the backing file; temp files are created here so
    /// the final rename stays on one filesystem.
    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn load(&self) -> Result<Vec<StoredSecret>, VaultError> {
        self.ensure_exists().await?;

        let raw = tokio::fs::read(&self.path).await?;
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        let records: Vec<KeyRecord> = serde_json::from_slice(&raw)?;
        records.into_iter().map(StoredSecret::try_from).collect()
    }

    async fn save(&self, records: &[StoredSecret]) -> Result<(), VaultError> {
        self.ensure_exists().await?;

        let serialized: Vec<KeyRecord> = records.iter().map(KeyRecord::from).collect();
        let json = serde_json::to_vec_pretty(&serialized)?;

        let dir = self.dir();
        let target = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), VaultError> {
            let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
            temp.write_all(&json)?;
            temp.as_file().sync_all()?;
            temp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| VaultError::Io(std::io::Error::other(e)))?
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// In-memory key store, for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    records: RwLock<Vec<StoredSecret>>,
}

impl MemoryKeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, expired ones included.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn load(&self) -> Result<Vec<StoredSecret>, VaultError> {
        Ok(self.records.read().clone())
    }

    async fn save(&self, records: &[StoredSecret]) -> Result<(), VaultError> {
        *self.records.write() = records.to_vec();
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
