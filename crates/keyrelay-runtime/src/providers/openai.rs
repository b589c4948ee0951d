//! OpenAI chat completions adapter.
//!
//! Speaks `POST {base_url}/chat/completions` with bearer auth. Works with any
//! OpenAI-compatible endpoint via [`OpenAiAdapter::with_base_url`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::{build_client, decode_error, status_kind, transport_error, ErrorResponse};
use super::sse::{pump_sse, ParsedEvent, SseEvent};
use super::{
    ApiCredential, ChatMessage, ChunkSink, CompletionRequest, CompletionResult, LlmError,
    LlmErrorKind, ProviderAdapter, TokenUsage,
};

pub const OPENAI_PROVIDER: &str = "openai";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";

/// OpenAI-style adapter.
pub struct OpenAiAdapter {
    client: reqwest::Client,
    base_url: String,
    default_model: String,
}

impl std::fmt::Debug for OpenAiAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiAdapter")
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

impl Default for OpenAiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiAdapter {
    pub fn new() -> Self {
        Self {
            client: build_client(),
            base_url: OPENAI_BASE_URL.to_string(),
            default_model: OPENAI_DEFAULT_MODEL.to_string(),
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

    fn build_request<'a>(&'a self, request: &'a CompletionRequest, stream: bool) -> OpenAiRequest<'a> {
        OpenAiRequest {
            model: request.model_or(&self.default_model),
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            stop: (!request.stop_sequences.is_empty()).then_some(&request.stop_sequences),
            presence_penalty: request.presence_penalty,
            frequency_penalty: request.frequency_penalty,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    async fn send(
        &self,
        body: &OpenAiRequest<'_>,
        credential: &ApiCredential,
    ) -> Result<reqwest::Response, LlmError> {
        // SECURITY: Only expose the credential here, at the point of use
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(credential.expose())
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(OPENAI_PROVIDER, e))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(map_error_response(ErrorResponse::read(response).await))
        }
    }
}

/// OpenAI API request format.
#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

/// OpenAI API response format.
#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    model: String,
    choices: Vec<Choice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: Option<u32>,
}

impl From<OpenAiUsage> for TokenUsage {
    fn from(u: OpenAiUsage) -> Self {
        Self {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u
                .total_tokens
                .unwrap_or(u.prompt_tokens.saturating_add(u.completion_tokens)),
        }
    }
}

/// One streamed `chat.completion.chunk`.
#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<OpenAiUsage>,
    error: Option<OpenAiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiError {
    error: OpenAiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    type_: Option<String>,
    code: Option<String>,
}

/// Kind for an OpenAI error body, refining the HTTP status.
fn classify(status: Option<u16>, detail: Option<&OpenAiErrorDetail>) -> LlmErrorKind {
    let code = detail.and_then(|d| d.code.as_deref()).unwrap_or_default();
    let type_ = detail.and_then(|d| d.type_.as_deref()).unwrap_or_default();

    match (code, type_) {
        ("context_length_exceeded", _) | ("string_above_max_length", _) => {
            LlmErrorKind::ContextLength
        }
        ("content_filter", _) | ("content_policy_violation", _) => LlmErrorKind::ContentFilter,
        ("invalid_api_key", _) | (_, "authentication_error") => LlmErrorKind::Authentication,
        ("rate_limit_exceeded", _) | (_, "rate_limit_error") => LlmErrorKind::RateLimit,
        (_, "server_error") => LlmErrorKind::ServerError,
        _ => status.map(status_kind).unwrap_or(LlmErrorKind::Unknown),
    }
}

fn map_error_response(response: ErrorResponse) -> LlmError {
    let detail = serde_json::from_str::<OpenAiError>(&response.body)
        .ok()
        .map(|e| e.error);
    let kind = classify(Some(response.status), detail.as_ref());
    response.into_error(OPENAI_PROVIDER, kind, detail.map(|d| d.message))
}

fn content_filtered() -> LlmError {
    LlmError::new(
        LlmErrorKind::ContentFilter,
        OPENAI_PROVIDER,
        "completion stopped by content filter",
    )
}

fn parse_stream_event(event: &SseEvent) -> Result<ParsedEvent, LlmError> {
    if event.data.trim() == "[DONE]" {
        return Ok(ParsedEvent::done());
    }

    let parsed: StreamEvent =
        serde_json::from_str(&event.data).map_err(|e| decode_error(OPENAI_PROVIDER, e))?;

    if let Some(detail) = parsed.error {
        let kind = classify(None, Some(&detail));
        return Err(LlmError::new(kind, OPENAI_PROVIDER, detail.message));
    }

    let mut out = ParsedEvent {
        usage: parsed.usage.map(TokenUsage::from),
        ..Default::default()
    };
    for choice in parsed.choices {
        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(content_filtered());
        }
        if let Some(text) = choice.delta.content {
            out.text.get_or_insert_with(String::new).push_str(&text);
        }
    }
    Ok(out)
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        OPENAI_PROVIDER
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

        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| decode_error(OPENAI_PROVIDER, e))?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            LlmError::new(LlmErrorKind::Unknown, OPENAI_PROVIDER, "response had no choices")
        })?;
        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(content_filtered());
        }

        Ok(CompletionResult {
            text: choice.message.content.unwrap_or_default(),
            usage: parsed.usage.map(TokenUsage::from).unwrap_or_default(),
            provider: OPENAI_PROVIDER.to_string(),
            model: parsed.model,
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
        pump_sse(OPENAI_PROVIDER, response, on_chunk, parse_stream_event).await
    }
}
