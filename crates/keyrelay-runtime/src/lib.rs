//! # keyrelay-runtime
//!
//! Provider orchestration and latency tracking for KeyRelay.
//!
//! This crate is the part of KeyRelay that talks to LLM vendors:
//! - [`providers`]: the normalized request contract and one adapter per
//!   wire format (OpenAI, Anthropic, Gemini), gated by cargo features
//! - [`Orchestrator`]: credential lookup, deadlines, retries and the
//!   per-provider circuit breaker
//! - [`PerformanceTracker`]: duration and time-to-first-token for every
//!   call, persisted off the caller's path
//! - [`KeyRelay`]: the facade exposing every public operation
//!
//! ## Example
//!
//! ```rust,ignore
//! use keyrelay_runtime::{CompletionRequest, KeyRelay, RuntimeConfig};
//!
//! let config = RuntimeConfig::load(None)?;
//! let relay = KeyRelay::from_config(&master_key, &config)?;
//! relay.bootstrap_from_env().await;
//!
//! let result = relay
//!     .complete("openai", &CompletionRequest::new("", "Say hello"), Some("user-42"))
//!     .await?;
//! println!("{}", result.text);
//! ```

pub mod bootstrap;
pub mod config;
pub mod orchestrator;
pub mod providers;
pub mod resilience;
pub mod service;
pub mod tracker;

pub use bootstrap::{bootstrap_from_env, BootstrapReport};
pub use config::{ConfigError, ProviderSettings, RuntimeConfig};
pub use orchestrator::Orchestrator;
pub use providers::{
    ApiCredential, ChatMessage, ChunkSink, CompletionMetrics, CompletionRequest,
    CompletionResult, CredentialSource, LlmError, LlmErrorKind, ProviderAdapter,
    ProviderRegistry, StreamChunk, TokenUsage,
};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, RetryPolicy};
pub use service::{KeyRelay, SetupError};
pub use tracker::{PerformanceTracker, TrackedCall};
