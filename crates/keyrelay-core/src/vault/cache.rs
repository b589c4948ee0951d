//! In-memory cache of decrypted secrets.
//!
//! Avoids a decrypt (and a durable read) on every `get_key`. Process memory is
//! treated as trusted; deployments that do not accept that use
//! [`CacheMode::Disabled`].

use chrono::{DateTime, Utc};
use moka::future::Cache;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;

/// How long decrypted secrets may stay in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Never cache; every read decrypts from the durable store.
    Disabled,

    /// Cache until the entry is replaced or removed.
    #[default]
    ProcessLifetime,

    /// Cache for at most the given duration.
    Ttl(Duration),
}

/// A cached plaintext secret plus the expiry of its durable record.
#[derive(Clone)]
struct CachedSecret {
    secret: Arc<SecretString>,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedSecret {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Concurrent provider → plaintext cache built on moka.
pub struct SecretCache {
    cache: Option<Cache<String, CachedSecret>>,
}

impl SecretCache {
    /// Create a cache with the given mode.
    pub fn new(mode: CacheMode) -> Self {
        let cache = match mode {
            CacheMode::Disabled => None,
            CacheMode::ProcessLifetime => Some(Cache::builder().max_capacity(1_024).build()),
            CacheMode::Ttl(ttl) => Some(
                Cache::builder()
                    .max_capacity(1_024)
                    .time_to_live(ttl)
                    .build(),
            ),
        };
        Self { cache }
    }

    /// Whether this cache ever holds entries.
    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Look up a live (unexpired) secret.
    ///
    /// Expired entries are dropped from the cache and reported as a miss.
    pub async fn get(&self, provider: &str) -> Option<SecretString> {
        let cache = self.cache.as_ref()?;
        let entry = cache.get(provider).await?;

        if entry.is_expired(Utc::now()) {
            cache.invalidate(provider).await;
            return None;
        }

        Some(SecretString::from(entry.secret.expose_secret().to_owned()))
    }

    /// Store a freshly written or decrypted secret.
    pub async fn insert(
        &self,
        provider: &str,
        secret: &str,
        expires_at: Option<DateTime<Utc>>,
    ) {
        if let Some(cache) = &self.cache {
            let entry = CachedSecret {
                secret: Arc::new(SecretString::from(secret.to_owned())),
                expires_at,
            };
            cache.insert(provider.to_owned(), entry).await;
        }
    }

    /// Drop a provider's entry.
    pub async fn invalidate(&self, provider: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(provider).await;
        }
    }

    /// Drop all entries.
    pub fn invalidate_all(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
        }
    }
}

impl Default for SecretCache {
    fn default() -> Self {
        Self::new(CacheMode::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cache_operations() {
        let cache = SecretCache::default();

        assert!(cache.get("openai").await.is_none());

        cache.insert("openai", "sk-one", None).await;
        let hit = cache.get("openai").await.unwrap();
        assert_eq!(hit.expose_secret(), "sk-one");

        cache.invalidate("openai").await;
        assert!(cache.get("openai").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = SecretCache::default();
        let past = Utc::now() - chrono::Duration::days(1);

        cache.insert("anthropic", "sk-ant", Some(past)).await;
        assert!(cache.get("anthropic").await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_cache_never_hits() {
        let cache = SecretCache::new(CacheMode::Disabled);
        assert!(!cache.is_enabled());

        cache.insert("gemini", "AIza-key", None).await;
        assert!(cache.get("gemini").await.is_none());
    }
}
