//! Encrypted provider credential vault.
//!
//! One record per provider (last write wins). Secrets are encrypted with
//! [`CipherStore`] before they reach the [`KeyStore`], and decrypted secrets
//! are kept in a [`SecretCache`].
//!
//! ## Failure semantics
//!
//! Every operation has a `try_*` form returning [`VaultError`]. The plain
//! forms log the failure and degrade to `false` / `None`, so a broken store
//! takes the affected provider offline instead of the process.
//!
//! ## Concurrency
//!
//! Writers (`store_key`, `rotate_key`, `remove_key`) serialize their
//! load-modify-save cycle on a single async mutex. Readers never take it:
//! stores replace the record set as a whole, so reads see either the old or
//! the new state. The cache is updated only after the durable write succeeds,
//! while the writer still holds the lock.

mod cache;
mod store;

pub use cache::{CacheMode, SecretCache};
pub use store::{FileKeyStore, KeyRecord, KeyStore, MemoryKeyStore, StoredSecret};

use chrono::{Duration, Utc};
use secrecy::SecretString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::cipher::{CipherError, CipherStore, DecryptionError};
use crate::redact::is_valid_provider_name;

/// Errors from vault operations.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Key store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key store is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to decrypt key for '{provider}': {source}")]
    Decryption {
        provider: String,
        source: DecryptionError,
    },

    #[error("Invalid key record: {0}")]
    InvalidRecord(String),

    #[error("Invalid provider name: '{0}'")]
    InvalidProvider(String),

    #[error("Cipher setup failed: {0}")]
    Cipher(#[from] CipherError),
}

/// Normalize a provider name: trimmed and lower-cased.
pub fn normalize_provider(provider: &str) -> String {
    provider.trim().to_lowercase()
}

/// Encrypted credential vault.
pub struct KeyVault {
    cipher: CipherStore,
    store: Arc<dyn KeyStore>,
    cache: SecretCache,
    write_lock: Mutex<()>,
    /// Bumped by every write, under `write_lock`
    generation: AtomicU64,
}

impl KeyVault {
    /// Create a vault over `store` using a raw 32-byte master key.
    ///
    /// Fails before touching the store if the key is not 32 bytes.
    pub fn new(
        master_key: &[u8],
        store: Arc<dyn KeyStore>,
        cache_mode: CacheMode,
    ) -> Result<Self, VaultError> {
        let cipher = CipherStore::new(master_key)?;
        Ok(Self::with_cipher(cipher, store, cache_mode))
    }

    /// Create a vault from an already validated cipher.
    pub fn with_cipher(cipher: CipherStore, store: Arc<dyn KeyStore>, cache_mode: CacheMode) -> Self {
        Self {
            cipher,
            store,
            cache: SecretCache::new(cache_mode),
            write_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Store (or replace) a provider's secret.
    ///
    /// `expires_in_days` may be negative, which stores an already expired key.
    pub async fn store_key(
        &self,
        provider: &str,
        secret: &str,
        expires_in_days: Option<i64>,
    ) -> bool {
        match self.try_store_key(provider, secret, expires_in_days).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(provider = %provider, error = %e, "Failed to store key");
                false
            }
        }
    }

    /// Fallible form of [`store_key`](Self::store_key).
    pub async fn try_store_key(
        &self,
        provider: &str,
        secret: &str,
        expires_in_days: Option<i64>,
    ) -> Result<(), VaultError> {
        let provider = validated_provider(provider)?;
        let encrypted = self.cipher.encrypt(secret);
        let now = Utc::now();
        let record = StoredSecret {
            provider: provider.clone(),
            ciphertext: encrypted.ciphertext,
            iv: encrypted.iv,
            created_at: now,
            expires_at: expires_in_days.map(|days| now + Duration::days(days)),
        };
        let expires_at = record.expires_at;

        {
            let _guard = self.write_lock.lock().await;
            let mut records = self.store.load().await?;
            records.retain(|r| r.provider != provider);
            records.push(record);
            self.store.save(&records).await?;
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.cache.insert(&provider, secret, expires_at).await;
        }

        tracing::info!(
            provider = %provider,
            store = self.store.name(),
            expires_at = ?expires_at,
            "Stored provider key"
        );
        Ok(())
    }

    /// Fetch a provider's secret, or `None` if absent, expired or unreadable.
    pub async fn get_key(&self, provider: &str) -> Option<SecretString> {
        match self.try_get_key(provider).await {
            Ok(secret) => secret,
            Err(e) => {
                tracing::error!(provider = %provider, error = %e, "Failed to read key");
                None
            }
        }
    }

    /// Fallible form of [`get_key`](Self::get_key).
    pub async fn try_get_key(&self, provider: &str) -> Result<Option<SecretString>, VaultError> {
        let provider = normalize_provider(provider);

        if let Some(secret) = self.cache.get(&provider).await {
            return Ok(Some(secret));
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let records = self.store.load().await?;
        let Some(record) = records.into_iter().find(|r| r.provider == provider) else {
            return Ok(None);
        };

        if record.is_expired(Utc::now()) {
            tracing::debug!(provider = %provider, "Ignoring expired key");
            return Ok(None);
        }

        let plaintext = self
            .cipher
            .decrypt(&record.ciphertext, &record.iv)
            .map_err(|source| VaultError::Decryption {
                provider: provider.clone(),
                source,
            })?;

        // Only fill the cache if no write landed since the load; a writer
        // holding the lock means the record we decrypted may already be stale.
        if let Ok(_guard) = self.write_lock.try_lock() {
            if self.generation.load(Ordering::SeqCst) == generation {
                self.cache
                    .insert(&provider, &plaintext, record.expires_at)
                    .await;
            }
        }
        Ok(Some(SecretString::from(plaintext)))
    }

    /// Delete a provider's record and cache entry. Removing a missing
    /// provider succeeds.
    pub async fn remove_key(&self, provider: &str) -> bool {
        match self.try_remove_key(provider).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(provider = %provider, error = %e, "Failed to remove key");
                false
            }
        }
    }

    /// Fallible form of [`remove_key`](Self::remove_key).
    pub async fn try_remove_key(&self, provider: &str) -> Result<(), VaultError> {
        let provider = normalize_provider(provider);

        {
            let _guard = self.write_lock.lock().await;
            let mut records = self.store.load().await?;
            let before = records.len();
            records.retain(|r| r.provider != provider);
            if records.len() != before {
                self.store.save(&records).await?;
                tracing::info!(provider = %provider, "Removed provider key");
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.cache.invalidate(&provider).await;
        }

        Ok(())
    }

    /// Replace a provider's secret. Same as [`store_key`](Self::store_key):
    /// the new record gets a fresh IV and the cache entry is replaced in the
    /// same step.
    pub async fn rotate_key(
        &self,
        provider: &str,
        new_secret: &str,
        expires_in_days: Option<i64>,
    ) -> bool {
        self.store_key(provider, new_secret, expires_in_days).await
    }

    /// Providers with a durable record, expired ones included.
    pub async fn list_providers(&self) -> Vec<String> {
        match self.try_list_providers().await {
            Ok(providers) => providers,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list providers");
                Vec::new()
            }
        }
    }

    /// Fallible form of [`list_providers`](Self::list_providers).
    pub async fn try_list_providers(&self) -> Result<Vec<String>, VaultError> {
        let mut providers: Vec<String> = self
            .store
            .load()
            .await?
            .into_iter()
            .map(|r| r.provider)
            .collect();
        providers.sort();
        Ok(providers)
    }

    /// True iff [`get_key`](Self::get_key) would return a secret.
    pub async fn has_valid_key(&self, provider: &str) -> bool {
        self.get_key(provider).await.is_some()
    }

    /// Whether decrypted secrets are cached.
    pub fn caches_secrets(&self) -> bool {
        self.cache.is_enabled()
    }
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVault")
            .field("store", &self.store.name())
            .field("cache", &self.cache.is_enabled())
            .finish()
    }
}

fn validated_provider(provider: &str) -> Result<String, VaultError> {
    let normalized = normalize_provider(provider);
    if is_valid_provider_name(&normalized) {
        Ok(normalized)
    } else {
        Err(VaultError::InvalidProvider(provider.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use secrecy::ExposeSecret;

    const KEY: [u8; 32] = [42u8; 32];

    fn vault_with(store: Arc<dyn KeyStore>, mode: CacheMode) -> KeyVault {
        KeyVault::new(&KEY, store, mode).unwrap()
    }

    struct FailingStore;

    #[async_trait]
    impl KeyStore for FailingStore {
        async fn load(&self) -> Result<Vec<StoredSecret>, VaultError> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into())
        }

        async fn save(&self, _records: &[StoredSecret]) -> Result<(), VaultError> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into())
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[test]
    fn test_key_length_checked_at_construction() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        let result = KeyVault::new(&[0u8; 31], store, CacheMode::default());
        assert!(matches!(
            result,
            Err(VaultError::Cipher(CipherError::InvalidKeyLength(31)))
        ));
    }

    #[tokio::test]
    async fn test_store_and_get_normalizes_provider() {
        let vault = vault_with(Arc::new(MemoryKeyStore::new()), CacheMode::default());

        assert!(vault.store_key("  OpenAI ", "sk-test-1", None).await);
        let secret = vault.get_key("openai").await.unwrap();
        assert_eq!(secret.expose_secret(), "sk-test-1");
        assert!(vault.has_valid_key("OPENAI").await);
        assert_eq!(vault.list_providers().await, vec!["openai".to_string()]);
    }

    #[tokio::test]
    async fn test_one_record_per_provider() {
        let store = Arc::new(MemoryKeyStore::new());
        let vault = vault_with(store.clone(), CacheMode::default());

        vault.store_key("openai", "first", None).await;
        vault.store_key("openai", "second", None).await;
        vault.store_key("gemini", "third", None).await;

        assert_eq!(store.len(), 2);
        assert_eq!(vault.get_key("openai").await.unwrap().expose_secret(), "second");
    }

    #[tokio::test]
    async fn test_expired_key_is_never_returned() {
        let store = Arc::new(MemoryKeyStore::new());
        for mode in [CacheMode::ProcessLifetime, CacheMode::Disabled] {
            let vault = vault_with(store.clone(), mode);
            assert!(vault.store_key("anthropic", "sk-ant-old", Some(-1)).await);

            assert!(vault.get_key("anthropic").await.is_none());
            assert!(!vault.has_valid_key("anthropic").await);
            // Lazily ignored, not purged
            assert_eq!(store.len(), 1);
            assert_eq!(vault.list_providers().await, vec!["anthropic".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_rotation_replaces_secret_and_iv() {
        let store = Arc::new(MemoryKeyStore::new());
        let vault = vault_with(store.clone(), CacheMode::default());

        vault.store_key("openai", "old-secret", Some(30)).await;
        let old_iv = store.load().await.unwrap()[0].iv;

        assert!(vault.rotate_key("openai", "new-secret", Some(30)).await);
        let records = store.load().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_ne!(records[0].iv, old_iv);
        assert_eq!(vault.get_key("openai").await.unwrap().expose_secret(), "new-secret");

        // A second vault over the same store has no cache and must decrypt
        let cold = vault_with(store, CacheMode::Disabled);
        assert_eq!(cold.get_key("openai").await.unwrap().expose_secret(), "new-secret");
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let vault = vault_with(Arc::new(MemoryKeyStore::new()), CacheMode::default());
        vault.store_key("gemini", "AIza-test", None).await;

        assert!(vault.remove_key("gemini").await);
        assert!(vault.remove_key("gemini").await);
        assert!(!vault.has_valid_key("gemini").await);
        assert!(vault.list_providers().await.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_master_key_degrades_to_none() {
        let store = Arc::new(MemoryKeyStore::new());
        let writer = vault_with(store.clone(), CacheMode::Disabled);
        writer.store_key("openai", "sk-live-0123456789", None).await;

        let reader = KeyVault::new(&[1u8; 32], store, CacheMode::Disabled).unwrap();
        match reader.try_get_key("openai").await {
            Err(VaultError::Decryption { provider, .. }) => assert_eq!(provider, "openai"),
            // Padding can survive a wrong key by chance; the secret must still differ
            Ok(Some(secret)) => assert_ne!(secret.expose_secret(), "sk-live-0123456789"),
            other => panic!("unexpected result: {:?}", other.map(|s| s.is_some())),
        }
    }

    #[tokio::test]
    async fn test_io_failures_degrade() {
        let vault = vault_with(Arc::new(FailingStore), CacheMode::default());

        assert!(!vault.store_key("openai", "sk", None).await);
        assert!(vault.get_key("openai").await.is_none());
        assert!(!vault.remove_key("openai").await);
        assert!(vault.list_providers().await.is_empty());
        assert!(matches!(
            vault.try_get_key("openai").await,
            Err(VaultError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_provider_rejected() {
        let vault = vault_with(Arc::new(MemoryKeyStore::new()), CacheMode::default());
        assert!(matches!(
            vault.try_store_key("../../etc", "x", None).await,
            Err(VaultError::InvalidProvider(_))
        ));
        assert!(!vault.store_key("", "x", None).await);
    }

    #[tokio::test]
    async fn test_file_backed_vault_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");

        {
            let vault = vault_with(Arc::new(FileKeyStore::new(&path)), CacheMode::default());
            assert!(vault.store_key("anthropic", "sk-ant-persisted", Some(7)).await);
        }

        let vault = vault_with(Arc::new(FileKeyStore::new(&path)), CacheMode::default());
        assert_eq!(
            vault.get_key("anthropic").await.unwrap().expose_secret(),
            "sk-ant-persisted"
        );
    }

    #[tokio::test]
    async fn test_concurrent_rotations_do_not_lose_providers() {
        let store = Arc::new(MemoryKeyStore::new());
        let vault = Arc::new(vault_with(store.clone(), CacheMode::default()));

        let mut handles = Vec::new();
        for i in 0..16 {
            let vault = vault.clone();
            handles.push(tokio::spawn(async move {
                let provider = format!("provider{}", i % 4);
                vault.rotate_key(&provider, &format!("secret-{}", i), None).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        assert_eq!(store.len(), 4);
        assert_eq!(vault.list_providers().await.len(), 4);
    }
}
