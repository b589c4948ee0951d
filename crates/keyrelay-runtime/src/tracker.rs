//! Latency tracking for provider calls.
//!
//! Every tracked call produces one [`PerformanceLogEntry`]. Entries are
//! written on background tasks; a failing store is logged and never changes
//! or delays what the caller gets back.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use keyrelay_core::{
    redact_secrets, ApiRequestLog, Operation, PerformanceLogEntry, PerformanceLogStore,
};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use crate::providers::{
    ChunkSink, CompletionRequest, CompletionResult, LlmError, StreamChunk, TokenUsage,
};

/// Identity of one tracked call.
#[derive(Debug, Clone, Copy)]
pub struct TrackedCall<'a> {
    pub provider: &'a str,
    pub model: &'a str,
    pub user_id: Option<&'a str>,
    /// Recorded as shape only, never prompt text or stop sequences
    pub request: Option<&'a CompletionRequest>,
}

/// Wraps provider calls and persists their timings.
pub struct PerformanceTracker {
    store: Arc<dyn PerformanceLogStore>,
    tasks: TaskTracker,
}

impl std::fmt::Debug for PerformanceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceTracker")
            .field("pending_writes", &self.tasks.len())
            .finish()
    }
}

impl PerformanceTracker {
    pub fn new(store: Arc<dyn PerformanceLogStore>) -> Self {
        Self {
            store,
            tasks: TaskTracker::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn PerformanceLogStore> {
        &self.store
    }

    /// Time a blocking completion and log it.
    pub async fn track_completion<F>(
        &self,
        call: TrackedCall<'_>,
        completion: F,
    ) -> Result<CompletionResult, LlmError>
    where
        F: Future<Output = Result<CompletionResult, LlmError>>,
    {
        let started = Instant::now();
        let outcome = completion.await;
        let elapsed = started.elapsed();

        let token_count = outcome
            .as_ref()
            .ok()
            .map(|r| r.usage.completion_tokens);
        self.persist_llm(build_entry(
            call,
            Operation::Completion,
            elapsed,
            None,
            token_count,
            outcome.as_ref().err(),
        ));
        outcome
    }

    /// Time a streaming completion and log it.
    ///
    /// `stream` receives a chunk sink that forwards every chunk unchanged to
    /// `on_chunk` while recording time-to-first-token at the first non-empty
    /// chunk.
    pub async fn track_streaming_completion<'s, F, Fut>(
        &self,
        call: TrackedCall<'_>,
        on_chunk: &'s mut ChunkSink<'_>,
        stream: F,
    ) -> Result<Option<TokenUsage>, LlmError>
    where
        F: FnOnce(Box<ChunkSink<'s>>) -> Fut,
        Fut: Future<Output = Result<Option<TokenUsage>, LlmError>>,
    {
        let started = Instant::now();
        let first_token: Arc<OnceLock<Duration>> = Arc::new(OnceLock::new());

        let sink: Box<ChunkSink<'s>> = {
            let first_token = Arc::clone(&first_token);
            Box::new(move |chunk: StreamChunk| {
                if !chunk.text.is_empty() {
                    first_token.get_or_init(|| started.elapsed());
                }
                on_chunk(chunk);
            })
        };

        let outcome = stream(sink).await;
        let elapsed = started.elapsed();

        let token_count = outcome
            .as_ref()
            .ok()
            .and_then(|usage| usage.map(|u| u.completion_tokens));
        self.persist_llm(build_entry(
            call,
            Operation::StreamingCompletion,
            elapsed,
            first_token.get().copied(),
            token_count,
            outcome.as_ref().err(),
        ));
        outcome
    }

    /// Log one API request handled by the surrounding application.
    pub fn track_api_request(
        &self,
        endpoint: &str,
        method: &str,
        status_code: u16,
        duration: Duration,
        user_id: Option<&str>,
    ) {
        let entry = ApiRequestLog {
            endpoint: endpoint.to_string(),
            method: method.to_uppercase(),
            status_code,
            duration_ms: millis(duration),
            user_id: user_id.map(str::to_string),
            timestamp: Utc::now(),
        };

        let store = Arc::clone(&self.store);
        self.tasks.spawn(async move {
            if let Err(e) = store.append_api(&entry).await {
                tracing::warn!(endpoint = %entry.endpoint, error = %e, "Failed to persist API request log");
            }
        });
    }

    /// Wait for every pending write.
    pub async fn flush(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    fn persist_llm(&self, entry: PerformanceLogEntry) {
        let store = Arc::clone(&self.store);
        self.tasks.spawn(async move {
            if let Err(e) = store.append_llm(&entry).await {
                tracing::warn!(
                    provider = %entry.provider,
                    error = %e,
                    "Failed to persist performance log entry"
                );
            }
        });
    }
}

fn build_entry(
    call: TrackedCall<'_>,
    operation: Operation,
    elapsed: Duration,
    time_to_first_token: Option<Duration>,
    token_count: Option<u32>,
    error: Option<&LlmError>,
) -> PerformanceLogEntry {
    PerformanceLogEntry {
        provider: call.provider.to_string(),
        model: call.model.to_string(),
        operation,
        user_id: call.user_id.map(str::to_string),
        time_to_first_token: time_to_first_token.map(millis),
        total_duration_ms: millis(elapsed),
        token_count,
        success: error.is_none(),
        error_kind: error.map(|e| e.kind.as_str().to_string()),
        error_message: error.map(|e| redact_secrets(&e.message)),
        timestamp: Utc::now(),
        metadata: call.request.map(request_shape).unwrap_or_default(),
    }
}

/// Request parameters worth aggregating on. Prompt text and stop sequence
/// contents stay out of the log.
fn request_shape(request: &CompletionRequest) -> Map<String, Value> {
    let mut shape = Map::new();
    let mut put = |key: &str, value: Option<Value>| {
        if let Some(value) = value {
            shape.insert(key.to_string(), value);
        }
    };

    put("temperature", request.temperature.map(Value::from));
    put("maxTokens", request.max_tokens.map(Value::from));
    put("topP", request.top_p.map(Value::from));
    put("presencePenalty", request.presence_penalty.map(Value::from));
    put("frequencyPenalty", request.frequency_penalty.map(Value::from));
    put("messageCount", Some(Value::from(request.messages.len())));
    put(
        "hasSystemPrompt",
        Some(Value::from(request.messages.iter().any(|m| m.is_system()))),
    );
    put(
        "stopSequenceCount",
        Some(Value::from(request.stop_sequences.len())),
    );
    shape
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{LlmErrorKind, StreamChunk};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use keyrelay_core::{LogStoreError, MemoryLogStore};

    struct FailingStore;

    #[async_trait]
    impl PerformanceLogStore for FailingStore {
        async fn append_llm(&self, _entry: &PerformanceLogEntry) -> Result<(), LogStoreError> {
            Err(std::io::Error::other("disk full").into())
        }

        async fn append_api(&self, _entry: &ApiRequestLog) -> Result<(), LogStoreError> {
            Err(std::io::Error::other("disk full").into())
        }

        async fn llm_entries(
            &self,
            _since: DateTime<Utc>,
        ) -> Result<Vec<PerformanceLogEntry>, LogStoreError> {
            Ok(Vec::new())
        }

        async fn api_entries(
            &self,
            _since: DateTime<Utc>,
        ) -> Result<Vec<ApiRequestLog>, LogStoreError> {
            Ok(Vec::new())
        }
    }

    fn call<'a>(request: Option<&'a CompletionRequest>) -> TrackedCall<'a> {
        TrackedCall {
            provider: "openai",
            model: "gpt-4o-mini",
            user_id: Some("user-7"),
            request,
        }
    }

    fn result() -> CompletionResult {
        CompletionResult {
            text: "hi".to_string(),
            usage: TokenUsage::new(5, 8),
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            metrics: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_time_to_first_token() {
        let store = Arc::new(MemoryLogStore::new());
        let tracker = PerformanceTracker::new(store.clone());

        let mut seen = Vec::new();
        let outcome = tracker
            .track_streaming_completion(call(None), &mut |c| seen.push(c), |mut sink| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                sink(StreamChunk::text("a"));
                tokio::time::sleep(Duration::from_millis(7)).await;
                sink(StreamChunk::text("b"));
                sink(StreamChunk::done());
                Ok(Some(TokenUsage::new(2, 2)))
            })
            .await;
        tracker.flush().await;

        assert!(outcome.is_ok());
        let texts: Vec<_> = seen.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", ""]);

        let entries = store.llm_snapshot();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.operation, Operation::StreamingCompletion);
        let ttft = entry.time_to_first_token.unwrap();
        assert!((ttft - 5.0).abs() < 1.0, "ttft {ttft}");
        assert!((entry.total_duration_ms - 12.0).abs() < 1.0);
        assert_eq!(entry.token_count, Some(2));
        assert!(entry.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_chunks_do_not_set_first_token() {
        let store = Arc::new(MemoryLogStore::new());
        let tracker = PerformanceTracker::new(store.clone());

        let _ = tracker
            .track_streaming_completion(call(None), &mut |_| {}, |mut sink| async move {
                sink(StreamChunk::text(""));
                tokio::time::sleep(Duration::from_millis(20)).await;
                sink(StreamChunk::text("x"));
                sink(StreamChunk::done());
                Ok(None)
            })
            .await;
        tracker.flush().await;

        let ttft = store.llm_snapshot()[0].time_to_first_token.unwrap();
        assert!((ttft - 20.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn test_failing_store_does_not_change_result() {
        let tracker = PerformanceTracker::new(Arc::new(FailingStore));

        let ok = tracker
            .track_completion(call(None), async { Ok(result()) })
            .await
            .unwrap();
        assert_eq!(ok, result());

        let err = tracker
            .track_completion(call(None), async {
                Err(LlmError::new(LlmErrorKind::RateLimit, "openai", "slow down"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::RateLimit);

        tracker.track_api_request("/v1/complete", "post", 200, Duration::from_millis(3), None);
        tracker.flush().await;
    }

    #[tokio::test]
    async fn test_failure_entry_is_redacted() {
        let store = Arc::new(MemoryLogStore::new());
        let tracker = PerformanceTracker::new(store.clone());

        let _ = tracker
            .track_completion(call(None), async {
                Err(LlmError::new(
                    LlmErrorKind::Authentication,
                    "openai",
                    "Incorrect API key provided: sk-abcdefghijklmnopqrstuvwx",
                ))
            })
            .await;
        tracker.flush().await;

        let entry = &store.llm_snapshot()[0];
        assert!(!entry.success);
        assert_eq!(entry.error_kind.as_deref(), Some("AUTHENTICATION"));
        let message = entry.error_message.as_deref().unwrap();
        assert!(!message.contains("sk-abcdefghijklmnopqrstuvwx"));
        assert_eq!(entry.token_count, None);
    }

    #[tokio::test]
    async fn test_metadata_is_request_shape_only() {
        let store = Arc::new(MemoryLogStore::new());
        let tracker = PerformanceTracker::new(store.clone());

        let mut request = CompletionRequest::new("", "the secret plan").temperature(0.2);
        request.stop_sequences = vec!["HALT-WORD".to_string()];

        tracker
            .track_completion(call(Some(&request)), async { Ok(result()) })
            .await
            .unwrap();
        tracker.flush().await;

        let entry = &store.llm_snapshot()[0];
        assert_eq!(entry.token_count, Some(8));
        assert_eq!(entry.user_id.as_deref(), Some("user-7"));
        assert_eq!(entry.metadata["messageCount"], 1);
        assert_eq!(entry.metadata["stopSequenceCount"], 1);
        assert!(entry.metadata.contains_key("temperature"));
        assert!(!entry.metadata.contains_key("maxTokens"));

        let json = serde_json::to_string(&entry.metadata).unwrap();
        assert!(!json.contains("secret plan"));
        assert!(!json.contains("HALT-WORD"));
    }

    #[tokio::test]
    async fn test_track_api_request() {
        let store = Arc::new(MemoryLogStore::new());
        let tracker = PerformanceTracker::new(store.clone());

        tracker.track_api_request("/v1/keys", "get", 404, Duration::from_millis(12), Some("u1"));
        tracker.flush().await;

        let rows = store.api_snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].method, "GET");
        assert_eq!(rows[0].status_code, 404);
        assert!(!rows[0].is_success());
        assert!((rows[0].duration_ms - 12.0).abs() < 0.01);
    }
}
