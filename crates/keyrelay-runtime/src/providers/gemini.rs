//! Google Gemini `generateContent` adapter.
//!
//! Assistant turns are sent with role `model`; system messages become
//! `systemInstruction`. Streaming uses `streamGenerateContent?alt=sse`, where
//! every event is a full response object and the last one carries
//! `finishReason`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::{build_client, decode_error, status_kind, transport_error, ErrorResponse};
use super::sse::{pump_sse, ParsedEvent, SseEvent};
use super::{
    ApiCredential, ChunkSink, CompletionRequest, CompletionResult, LlmError, LlmErrorKind,
    ProviderAdapter, TokenUsage,
};

pub const GEMINI_PROVIDER: &str = "gemini";
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const GEMINI_DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// Finish reasons that mean the output was blocked.
const BLOCKED_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
];

/// Gemini adapter.
pub struct GeminiAdapter {
    client: reqwest::Client,
    base_url: String,
    default_model: String,
}

impl std::fmt::Debug for GeminiAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiAdapter")
            .field("base_url", &self.base_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

impl Default for GeminiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiAdapter {
    pub fn new() -> Self {
        Self {
            client: build_client(),
            base_url: GEMINI_BASE_URL.to_string(),
            default_model: GEMINI_DEFAULT_MODEL.to_string(),
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

    fn build_request<'a>(&self, request: &'a CompletionRequest) -> GeminiRequest<'a> {
        let system: Vec<Part<'a>> = request
            .messages
            .iter()
            .filter(|m| m.is_system())
            .map(|m| Part { text: &m.content })
            .collect();

        let contents = request
            .messages
            .iter()
            .filter(|m| !m.is_system())
            .map(|m| Content {
                role: if m.role == "assistant" { "model" } else { "user" },
                parts: vec![Part { text: &m.content }],
            })
            .collect();

        GeminiRequest {
            contents,
            system_instruction: (!system.is_empty()).then_some(SystemInstruction { parts: system }),
            generation_config: GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
                top_p: request.top_p,
                stop_sequences: (!request.stop_sequences.is_empty())
                    .then_some(&request.stop_sequences),
                presence_penalty: request.presence_penalty,
                frequency_penalty: request.frequency_penalty,
            },
        }
    }

    async fn send(
        &self,
        url: String,
        body: &GeminiRequest<'_>,
        credential: &ApiCredential,
    ) -> Result<reqwest::Response, LlmError> {
        // SECURITY: Only expose the credential here, at the point of use
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", credential.expose())
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(GEMINI_PROVIDER, e))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(map_error_response(ErrorResponse::read(response).await))
        }
    }
}

/// Gemini API request format.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction<'a>>,
    generation_config: GenerationConfig<'a>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<&'a Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
}

/// Gemini API response format (blocking and per stream event).
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    model_version: Option<String>,
    prompt_feedback: Option<PromptFeedback>,
    error: Option<GeminiErrorDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    total_token_count: Option<u32>,
}

impl From<UsageMetadata> for TokenUsage {
    fn from(u: UsageMetadata) -> Self {
        Self {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u
                .total_token_count
                .unwrap_or(u.prompt_token_count.saturating_add(u.candidates_token_count)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    #[serde(default)]
    message: String,
    status: Option<String>,
}

fn classify(status: Option<u16>, detail: &GeminiErrorDetail) -> LlmErrorKind {
    match detail.status.as_deref().unwrap_or_default() {
        "UNAUTHENTICATED" | "PERMISSION_DENIED" => LlmErrorKind::Authentication,
        "RESOURCE_EXHAUSTED" => LlmErrorKind::RateLimit,
        "INVALID_ARGUMENT" if is_context_overflow(&detail.message) => LlmErrorKind::ContextLength,
        "INVALID_ARGUMENT" | "FAILED_PRECONDITION" | "NOT_FOUND" => LlmErrorKind::InvalidRequest,
        "INTERNAL" | "UNAVAILABLE" => LlmErrorKind::ServerError,
        "DEADLINE_EXCEEDED" => LlmErrorKind::Timeout,
        _ => status.map(status_kind).unwrap_or(LlmErrorKind::Unknown),
    }
}

fn is_context_overflow(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("exceeds the maximum number of tokens") || message.contains("too long")
}

fn map_error_response(response: ErrorResponse) -> LlmError {
    // Errors sometimes come wrapped in a one-element array
    let detail = serde_json::from_str::<GeminiError>(&response.body)
        .map(|e| e.error)
        .or_else(|_| {
            serde_json::from_str::<Vec<GeminiError>>(&response.body)
                .map_err(|_| ())
                .and_then(|v| v.into_iter().next().map(|e| e.error).ok_or(()))
        })
        .ok();

    match detail {
        Some(detail) => {
            let kind = classify(Some(response.status), &detail);
            response.into_error(GEMINI_PROVIDER, kind, Some(detail.message))
        }
        None => {
            let kind = status_kind(response.status);
            response.into_error(GEMINI_PROVIDER, kind, None)
        }
    }
}

fn blocked(reason: &str) -> LlmError {
    LlmError::new(
        LlmErrorKind::ContentFilter,
        GEMINI_PROVIDER,
        format!("blocked by safety filters ({})", reason),
    )
}

/// Check for blocked prompts/output and collect candidate text.
fn extract(response: &mut GeminiResponse) -> Result<(String, Option<String>), LlmError> {
    if let Some(reason) = response
        .prompt_feedback
        .as_ref()
        .and_then(|f| f.block_reason.as_deref())
    {
        return Err(blocked(reason));
    }

    let Some(candidate) = response.candidates.first_mut() else {
        return Ok((String::new(), None));
    };

    let finish = candidate.finish_reason.take();
    if let Some(reason) = finish.as_deref() {
        if BLOCKED_FINISH_REASONS.contains(&reason) {
            return Err(blocked(reason));
        }
    }

    let text = candidate
        .content
        .take()
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect::<String>())
        .unwrap_or_default();
    Ok((text, finish))
}

fn parse_stream_event(event: &SseEvent) -> Result<ParsedEvent, LlmError> {
    let mut parsed: GeminiResponse =
        serde_json::from_str(&event.data).map_err(|e| decode_error(GEMINI_PROVIDER, e))?;

    if let Some(detail) = parsed.error.take() {
        let kind = classify(None, &detail);
        return Err(LlmError::new(kind, GEMINI_PROVIDER, detail.message));
    }

    let (text, finish) = extract(&mut parsed)?;
    Ok(ParsedEvent {
        text: Some(text),
        usage: parsed.usage_metadata.map(TokenUsage::from),
        done: finish.is_some_and(|r| r != "FINISH_REASON_UNSPECIFIED"),
    })
}

/// The model name as a URL path segment. Names outside `[A-Za-z0-9._-]`
/// would change the request target and are rejected.
fn model_segment(model: &str) -> Result<&str, LlmError> {
    let valid = !model.is_empty()
        && model
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'));
    if valid {
        Ok(model)
    } else {
        Err(LlmError::new(
            LlmErrorKind::InvalidRequest,
            GEMINI_PROVIDER,
            format!("invalid model name '{}'", model),
        ))
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        GEMINI_PROVIDER
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        credential: &ApiCredential,
    ) -> Result<CompletionResult, LlmError> {
        let model = request.model_or(&self.default_model);
        let url = format!("{}/models/{}:generateContent", self.base_url, model_segment(model)?);
        let response = self.send(url, &self.build_request(request), credential).await?;

        let mut parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| decode_error(GEMINI_PROVIDER, e))?;
        let (text, _) = extract(&mut parsed)?;

        Ok(CompletionResult {
            text,
            usage: parsed.usage_metadata.map(TokenUsage::from).unwrap_or_default(),
            provider: GEMINI_PROVIDER.to_string(),
            model: parsed.model_version.unwrap_or_else(|| model.to_string()),
            metrics: None,
        })
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        credential: &ApiCredential,
        on_chunk: &mut ChunkSink<'_>,
    ) -> Result<Option<TokenUsage>, LlmError> {
        let model = request.model_or(&self.default_model);
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url,
            model_segment(model)?
        );
        let response = self.send(url, &self.build_request(request), credential).await?;
        pump_sse(GEMINI_PROVIDER, response, on_chunk, parse_stream_event).await
    }
}
