//! HTTP plumbing shared by the reqwest-based adapters.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;

use super::{LlmError, LlmErrorKind};

/// Connect timeout for provider clients. The per-request deadline is applied
/// by the orchestrator.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream error bodies are truncated to this many chars in messages.
const MAX_ERROR_BODY: usize = 512;

/// Build the client an adapter keeps for its lifetime.
pub(crate) fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Falling back to default HTTP client");
            reqwest::Client::new()
        })
}

/// Map a transport failure.
pub(crate) fn transport_error(provider: &str, error: reqwest::Error) -> LlmError {
    let kind = if error.is_timeout() {
        LlmErrorKind::Timeout
    } else if error.is_connect() || error.is_request() || error.is_body() {
        LlmErrorKind::ServerError
    } else {
        LlmErrorKind::Unknown
    };
    LlmError::new(kind, provider, error.without_url().to_string())
}

/// Map a body that does not match the expected schema.
pub(crate) fn decode_error(provider: &str, error: impl std::fmt::Display) -> LlmError {
    LlmError::new(
        LlmErrorKind::Unknown,
        provider,
        format!("unexpected response body: {}", error),
    )
}

/// Default HTTP status mapping; adapters refine it from the error body.
pub(crate) fn status_kind(status: u16) -> LlmErrorKind {
    match status {
        401 | 403 => LlmErrorKind::Authentication,
        408 => LlmErrorKind::Timeout,
        413 => LlmErrorKind::ContextLength,
        429 => LlmErrorKind::RateLimit,
        400 | 404 | 409 | 422 => LlmErrorKind::InvalidRequest,
        500..=599 => LlmErrorKind::ServerError,
        _ => LlmErrorKind::Unknown,
    }
}

/// A non-2xx response, read to completion.
pub(crate) struct ErrorResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl ErrorResponse {
    pub async fn read(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        Self {
            status,
            retry_after,
            body,
        }
    }

    /// Build the error with `kind`, falling back to `fallback_message` when
    /// the body had no usable message.
    pub fn into_error(self, provider: &str, kind: LlmErrorKind, message: Option<String>) -> LlmError {
        let message = message.unwrap_or_else(|| {
            if self.body.trim().is_empty() {
                format!("HTTP {}", self.status)
            } else {
                truncate(&self.body, MAX_ERROR_BODY)
            }
        });
        LlmError::new(kind, provider, message)
            .with_status(self.status)
            .with_retry_after(self.retry_after)
    }
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = value.parse::<f64>() {
        return (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - Utc::now()).to_std().ok()
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_status_kind() {
        assert_eq!(status_kind(401), LlmErrorKind::Authentication);
        assert_eq!(status_kind(429), LlmErrorKind::RateLimit);
        assert_eq!(status_kind(422), LlmErrorKind::InvalidRequest);
        assert_eq!(status_kind(503), LlmErrorKind::ServerError);
        assert_eq!(status_kind(529), LlmErrorKind::ServerError);
        assert_eq!(status_kind(418), LlmErrorKind::Unknown);
    }

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("0.5"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_millis(500)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_retry_after_past_date_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("abc", 3), "abc");
    }
}
