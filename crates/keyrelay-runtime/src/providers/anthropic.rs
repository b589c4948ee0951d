//! Anthropic Messages API adapter.
//!
//! System messages are lifted into the top-level `system` field. The API has
//! no presence/frequency penalties, so those request fields are ignored.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::{build_client, decode_error, status_kind, transport_error, ErrorResponse};
use super::sse::{pump_sse, ParsedEvent, SseEvent};
use super::{
    ApiCredential, ChunkSink, CompletionRequest, CompletionResult, LlmError, LlmErrorKind,
    ProviderAdapter, TokenUsage,
};

pub const ANTHROPIC_PROVIDER: &str = "anthropic";
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const ANTHROPIC_DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// `max_tokens` is required by the API; used when the request has none.
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Anthropic Claude adapter.
pub struct AnthropicAdapter {
    client: reqwest::Client,
    base_url: String,
    default_model: String,
}

impl std::fmt::Debug for AnthropicAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicAdapter")
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self {
            client: build_client(),
            base_url: ANTHROPIC_BASE_URL.to_string(),
            default_model: ANTHROPIC_DEFAULT_MODEL.to_string(),
        }
    }

    /// Set custom base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn build_request<'a>(
        &'a self,
        request: &'a CompletionRequest,
        stream: bool,
    ) -> AnthropicRequest<'a> {
        // Extract system messages; the API takes them out of band
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.is_system())
            .map(|m| m.content.as_str())
            .collect();

        let messages = request
            .messages
            .iter()
            .filter(|m| !m.is_system())
            .map(|m| AnthropicMessage {
                role: &m.role,
                content: &m.content,
            })
            .collect();

        AnthropicRequest {
            model: request.model_or(&self.default_model),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: (!system.is_empty()).then(|| system.join("\n\n")),
            messages,
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: (!request.stop_sequences.is_empty()).then_some(&request.stop_sequences),
            stream,
        }
    }

    async fn send(
        &self,
        body: &AnthropicRequest<'_>,
        credential: &ApiCredential,
    ) -> Result<reqwest::Response, LlmError> {
        // SECURITY: Only expose the credential here, at the point of use
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", credential.expose())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(ANTHROPIC_PROVIDER, e))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(map_error_response(ErrorResponse::read(response).await))
        }
    }
}

/// Anthropic API request format.
#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<&'a Vec<String>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// Anthropic API response format.
#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlockResponse>,
    model: String,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlockResponse {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    #[serde(rename = "type")]
    type_: String,
    message: String,
}

/// Streaming event payloads, tagged by their `type` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StreamMessage,
    },
    ContentBlockDelta {
        delta: BlockDelta,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: AnthropicUsage,
    },
    MessageStop,
    Error {
        error: AnthropicErrorDetail,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct BlockDelta {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

fn classify(status: Option<u16>, detail: &AnthropicErrorDetail) -> LlmErrorKind {
    match detail.type_.as_str() {
        "authentication_error" | "permission_error" => LlmErrorKind::Authentication,
        "rate_limit_error" => LlmErrorKind::RateLimit,
        "overloaded_error" | "api_error" => LlmErrorKind::ServerError,
        "request_too_large" => LlmErrorKind::ContextLength,
        "invalid_request_error" if is_context_overflow(&detail.message) => {
            LlmErrorKind::ContextLength
        }
        "invalid_request_error" | "not_found_error" => LlmErrorKind::InvalidRequest,
        _ => status.map(status_kind).unwrap_or(LlmErrorKind::Unknown),
    }
}

fn is_context_overflow(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("prompt is too long") || message.contains("context window")
}

fn map_error_response(response: ErrorResponse) -> LlmError {
    match serde_json::from_str::<AnthropicError>(&response.body) {
        Ok(body) => {
            let kind = classify(Some(response.status), &body.error);
            response.into_error(ANTHROPIC_PROVIDER, kind, Some(body.error.message))
        }
        Err(_) => {
            let kind = status_kind(response.status);
            response.into_error(ANTHROPIC_PROVIDER, kind, None)
        }
    }
}

fn refused() -> LlmError {
    LlmError::new(
        LlmErrorKind::ContentFilter,
        ANTHROPIC_PROVIDER,
        "model refused to answer",
    )
}

/// Build a stateful stream event parser; usage arrives split across
/// `message_start` and `message_delta`.
fn stream_parser() -> impl FnMut(&SseEvent) -> Result<ParsedEvent, LlmError> + Send {
    let mut input_tokens = 0u32;
    move |event: &SseEvent| {
        let parsed: StreamEvent =
            serde_json::from_str(&event.data).map_err(|e| decode_error(ANTHROPIC_PROVIDER, e))?;

        match parsed {
            StreamEvent::MessageStart { message } => {
                input_tokens = message.usage.input_tokens;
                Ok(ParsedEvent::skip())
            }
            StreamEvent::ContentBlockDelta { delta } => {
                Ok(delta.text.map(ParsedEvent::text).unwrap_or_default())
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.as_deref() == Some("refusal") {
                    return Err(refused());
                }
                Ok(ParsedEvent {
                    usage: Some(TokenUsage::new(input_tokens, usage.output_tokens)),
                    ..Default::default()
                })
            }
            StreamEvent::MessageStop => Ok(ParsedEvent::done()),
            StreamEvent::Error { error } => {
                let kind = classify(None, &error);
                Err(LlmError::new(kind, ANTHROPIC_PROVIDER, error.message))
            }
            StreamEvent::Other => Ok(ParsedEvent::skip()),
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        ANTHROPIC_PROVIDER
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        credential: &ApiCredential,
    ) -> Result<CompletionResult, LlmError> {
        let body = self.build_request(request, false);
        let response = self.send(&body, credential).await?;

        let body: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| decode_error(ANTHROPIC_PROVIDER, e))?;

        if body.stop_reason.as_deref() == Some("refusal") {
            return Err(refused());
        }

        let text = body
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(CompletionResult {
            text,
            usage: TokenUsage::new(body.usage.input_tokens, body.usage.output_tokens),
            provider: ANTHROPIC_PROVIDER.to_string(),
            model: body.model,
            metrics: None,
        })
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        credential: &ApiCredential,
        on_chunk: &mut ChunkSink<'_>,
    ) -> Result<Option<TokenUsage>, LlmError> {
        let body = self.build_request(request, true);
        let response = self.send(&body, credential).await?;
        pump_sse(ANTHROPIC_PROVIDER, response, on_chunk, stream_parser()).await
    }
}
