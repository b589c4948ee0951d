//! Provider adapters for keyrelay-runtime.
//!
//! This module defines the normalized completion contract and the
//! [`ProviderAdapter`] trait, with one implementation per upstream wire
//! format (OpenAI, Anthropic, Gemini).
//!
//! ## Security
//!
//! Adapters receive credentials as [`ApiCredential`], which never prints its
//! value. They expose it only when setting the auth header.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

mod registry;
pub mod secrets;

#[cfg(any(feature = "openai", feature = "anthropic", feature = "gemini"))]
mod http;
#[cfg(any(feature = "openai", feature = "anthropic", feature = "gemini"))]
mod sse;

#[cfg(feature = "anthropic")]
mod anthropic;
#[cfg(feature = "gemini")]
mod gemini;
#[cfg(feature = "openai")]
mod openai;

pub use registry::ProviderRegistry;
pub use secrets::{ApiCredential, CredentialSource};

#[cfg(feature = "anthropic")]
pub use anthropic::AnthropicAdapter;
#[cfg(feature = "gemini")]
pub use gemini::GeminiAdapter;
#[cfg(feature = "openai")]
pub use openai::OpenAiAdapter;

/// Normalized provider failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LlmErrorKind {
    /// Missing, invalid or revoked credential
    Authentication,
    RateLimit,
    /// Prompt plus completion exceed the model window
    ContextLength,
    ContentFilter,
    InvalidRequest,
    ServerError,
    Timeout,
    /// Stream cancelled by the caller
    Cancelled,
    Unknown,
}

impl LlmErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmErrorKind::Authentication => "AUTHENTICATION",
            LlmErrorKind::RateLimit => "RATE_LIMIT",
            LlmErrorKind::ContextLength => "CONTEXT_LENGTH",
            LlmErrorKind::ContentFilter => "CONTENT_FILTER",
            LlmErrorKind::InvalidRequest => "INVALID_REQUEST",
            LlmErrorKind::ServerError => "SERVER_ERROR",
            LlmErrorKind::Timeout => "TIMEOUT",
            LlmErrorKind::Cancelled => "CANCELLED",
            LlmErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// Only transient kinds are retried by the orchestrator.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimit | LlmErrorKind::ServerError | LlmErrorKind::Timeout
        )
    }
}

impl fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider failure, already normalized by its adapter.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{provider}: {kind}: {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub provider: String,
    pub message: String,

    /// Upstream HTTP status, when there was one
    pub status: Option<u16>,

    /// Upstream `Retry-After` hint
    pub retry_after: Option<Duration>,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            provider: provider.into(),
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// A chat message for LLM completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: "system", "user", or "assistant"
    pub role: String,

    /// Message content
    pub content: String,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == "system"
    }
}

/// Provider-agnostic completion request. Adapters only read it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model id; empty means the adapter's default model
    #[serde(default)]
    pub model: String,

    pub messages: Vec<ChatMessage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
}

impl CompletionRequest {
    /// Request with a single user message.
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![ChatMessage::user(prompt)],
            ..Default::default()
        }
    }

    pub fn with_messages(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// `model`, or `default` when the request left it empty.
    pub fn model_or<'a>(&'a self, default: &'a str) -> &'a str {
        if self.model.trim().is_empty() {
            default
        } else {
            &self.model
        }
    }
}

/// Token usage from a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Usage with `total_tokens` computed from the parts.
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Timing filled in by the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_first_token: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_time: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_second: Option<f64>,
}

/// Normalized completion response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub text: String,
    pub usage: TokenUsage,
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<CompletionMetrics>,
}

/// One streamed piece of a completion.
///
/// Exactly one chunk per call has `is_final = true`, and it is the last one.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    pub text: String,
    pub is_final: bool,
    pub error: Option<LlmError>,
}

impl StreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            error: None,
        }
    }

    pub fn done() -> Self {
        Self {
            text: String::new(),
            is_final: true,
            error: None,
        }
    }

    pub fn failed(error: LlmError) -> Self {
        Self {
            text: String::new(),
            is_final: true,
            error: Some(error),
        }
    }
}

/// Chunk callback handed to adapters.
pub type ChunkSink<'a> = dyn FnMut(StreamChunk) + Send + 'a;

/// One upstream wire format.
///
/// Adapters translate requests and responses and map every failure into an
/// [`LlmError`]. They never retry; that is the orchestrator's job.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name used as the vault key and in logs.
    fn name(&self) -> &str;

    /// Model used when a request leaves `model` empty.
    fn default_model(&self) -> &str;

    /// Blocking completion.
    async fn complete(
        &self,
        request: &CompletionRequest,
        credential: &ApiCredential,
    ) -> Result<CompletionResult, LlmError>;

    /// Streaming completion.
    ///
    /// Calls `on_chunk` for every non-empty text delta in arrival order, then
    /// once with [`StreamChunk::done`] on success. On failure it returns the
    /// error without a final chunk; the orchestrator delivers that.
    /// Returns usage when the provider reported it.
    async fn stream(
        &self,
        request: &CompletionRequest,
        credential: &ApiCredential,
        on_chunk: &mut ChunkSink<'_>,
    ) -> Result<Option<TokenUsage>, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_creation() {
        let system = ChatMessage::system("You are a helpful assistant.");
        assert_eq!(system.role, "system");
        assert!(system.is_system());

        let user = ChatMessage::user("Hello!");
        assert_eq!(user.role, "user");

        let assistant = ChatMessage::assistant("Hi there!");
        assert_eq!(assistant.role, "assistant");
    }

    #[test]
    fn test_retryable_kinds() {
        let retryable: Vec<_> = [
            LlmErrorKind::Authentication,
            LlmErrorKind::RateLimit,
            LlmErrorKind::ContextLength,
            LlmErrorKind::ContentFilter,
            LlmErrorKind::InvalidRequest,
            LlmErrorKind::ServerError,
            LlmErrorKind::Timeout,
            LlmErrorKind::Cancelled,
            LlmErrorKind::Unknown,
        ]
        .into_iter()
        .filter(LlmErrorKind::is_retryable)
        .collect();

        assert_eq!(
            retryable,
            vec![
                LlmErrorKind::RateLimit,
                LlmErrorKind::ServerError,
                LlmErrorKind::Timeout
            ]
        );
    }

    #[test]
    fn test_token_total_saturates() {
        assert_eq!(TokenUsage::new(4, 6).total_tokens, 10);
        assert_eq!(TokenUsage::new(u32::MAX, 5).total_tokens, u32::MAX);
    }

    #[test]
    fn test_error_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&LlmErrorKind::RateLimit).unwrap(),
            "\"RATE_LIMIT\""
        );
        assert_eq!(LlmErrorKind::ContextLength.to_string(), "CONTEXT_LENGTH");
    }

    #[test]
    fn test_error_display() {
        let err = LlmError::new(LlmErrorKind::Timeout, "openai", "no response").with_status(408);
        assert_eq!(err.to_string(), "openai: TIMEOUT: no response");
        assert_eq!(err.status, Some(408));
    }

    #[test]
    fn test_model_or_default() {
        let req = CompletionRequest::new("", "hi");
        assert_eq!(req.model_or("gpt-4o-mini"), "gpt-4o-mini");

        let req = CompletionRequest::new("gpt-4o", "hi").temperature(0.2).max_tokens(64);
        assert_eq!(req.model_or("gpt-4o-mini"), "gpt-4o");
        assert_eq!(req.temperature, Some(0.2));
    }

    #[test]
    fn test_token_usage_total() {
        assert_eq!(TokenUsage::new(100, 50).total_tokens, 150);
    }
}
