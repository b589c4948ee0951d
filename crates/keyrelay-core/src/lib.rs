//! # keyrelay-core
//!
//! Encrypted credential storage and performance log aggregation.
//!
//! This crate holds the parts of KeyRelay that never talk to an LLM:
//! - [`CipherStore`]: AES-256-CBC with a fresh random IV per secret
//! - [`KeyVault`]: one encrypted record per provider, with expiry and a
//!   decrypted-secret cache
//! - [`telemetry`]: the append-only performance log schema and its stores
//! - [`AggregationReader`]: p50/p95/p99 metrics and dashboards over that log
//!
//! ## Key Guarantees
//!
//! 1. **No IV reuse**: every `encrypt` draws a new IV
//! 2. **Expired keys are never returned**, from the store or the cache
//! 3. **Single writer**: store, rotate and remove serialize their
//!    read-modify-write of the record set
//!
//! ## Example
//!
//! ```rust,ignore
//! use keyrelay_core::{CacheMode, FileKeyStore, KeyVault};
//! use std::sync::Arc;
//!
//! let vault = KeyVault::new(&master_key, Arc::new(FileKeyStore::new("keys.json")), CacheMode::default())?;
//! vault.store_key("openai", "sk-...", Some(90)).await;
//! assert!(vault.has_valid_key("OpenAI").await);
//! ```

pub mod aggregation;
pub mod cipher;
pub mod redact;
pub mod telemetry;
pub mod vault;

// Re-export main types at crate root
pub use aggregation::{
    AggregationReader, ApiPerformanceMetrics, DashboardData, LatencySummary,
    LlmPerformanceMetrics, MetricType, PerformanceAggregate, TimeWindow,
};
pub use cipher::{CipherError, CipherStore, DecryptionError, EncryptedSecret};
pub use redact::{redact_secrets, REDACTED};
pub use telemetry::{
    ApiRequestLog, JsonlLogStore, LogStoreError, MemoryLogStore, Operation, PerformanceLogEntry,
    PerformanceLogStore,
};
pub use vault::{
    normalize_provider, CacheMode, FileKeyStore, KeyStore, KeyVault, MemoryKeyStore,
    StoredSecret, VaultError,
};
