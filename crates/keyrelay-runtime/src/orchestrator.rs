//! Request orchestration across providers.
//!
//! The orchestrator is the single place where provider calls are retried,
//! timed out and short-circuited. It:
//! - Resolves a provider name to its adapter through the static registry
//! - Pulls the credential from the vault, failing with `AUTHENTICATION`
//!   before any network call when none is stored
//! - Retries retryable errors with capped exponential backoff
//! - Retries streams only while nothing has been delivered to the caller

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keyrelay_core::KeyVault;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::providers::{
    ApiCredential, ChunkSink, CompletionMetrics, CompletionRequest, CompletionResult, LlmError,
    LlmErrorKind, ProviderAdapter, ProviderRegistry, StreamChunk, TokenUsage,
};
use crate::resilience::{retry, CircuitBreaker, RetryPolicy};

/// Routes normalized requests to provider adapters.
pub struct Orchestrator {
    vault: Arc<KeyVault>,
    registry: ProviderRegistry,
    retry: RetryPolicy,
    request_timeout: Duration,
    circuit_breaker: CircuitBreaker,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("retry", &self.retry)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Orchestrator {
    /// Create an orchestrator from runtime configuration.
    pub fn new(vault: Arc<KeyVault>, registry: ProviderRegistry, config: &RuntimeConfig) -> Self {
        Self {
            vault,
            registry,
            retry: config.retry.clone(),
            request_timeout: config.request_timeout,
            circuit_breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    /// Model an adapter would use for `request`.
    pub fn resolve_model(&self, provider: &str, request: &CompletionRequest) -> String {
        match self.registry.get(provider) {
            Some(adapter) => request.model_or(adapter.default_model()).to_string(),
            None => request.model.clone(),
        }
    }

    /// Blocking completion with retries.
    pub async fn complete(
        &self,
        provider: &str,
        request: &CompletionRequest,
        user_id: Option<&str>,
    ) -> Result<CompletionResult, LlmError> {
        let (adapter, credential) = self.prepare(provider).await?;
        let name = adapter.name();
        let started = Instant::now();

        let mut result = retry(&self.retry, name, |attempt| {
            tracing::debug!(provider = name, attempt, user_id, "Sending completion request");
            self.attempt(name, adapter.complete(request, &credential))
        })
        .await?;

        let total_time = started.elapsed();
        let metrics = result.metrics.get_or_insert_with(CompletionMetrics::default);
        metrics.total_time = Some(total_time);
        metrics.tokens_per_second = tokens_per_second(result.usage.completion_tokens, total_time);

        Ok(result)
    }

    /// Streaming completion.
    ///
    /// `on_chunk` receives text chunks in arrival order and then exactly one
    /// final chunk, whose `error` is set on failure. Retryable errors are
    /// retried only before the first chunk is delivered. Cancelling `cancel`
    /// drops the upstream response and fails with `CANCELLED`.
    pub async fn stream_complete(
        &self,
        provider: &str,
        request: &CompletionRequest,
        user_id: Option<&str>,
        on_chunk: &mut ChunkSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<Option<TokenUsage>, LlmError> {
        let delivered = AtomicBool::new(false);
        let mut gate = ChunkGate {
            sink: on_chunk,
            delivered: &delivered,
            finished: false,
        };

        let outcome = match self.prepare(provider).await {
            Ok((adapter, credential)) => {
                self.run_stream(
                    adapter.as_ref(),
                    &credential,
                    request,
                    user_id,
                    &mut gate,
                    &delivered,
                    cancel,
                )
                .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(usage) => {
                gate.finish();
                Ok(usage)
            }
            Err(e) => {
                gate.fail(e.clone());
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stream(
        &self,
        adapter: &dyn ProviderAdapter,
        credential: &ApiCredential,
        request: &CompletionRequest,
        user_id: Option<&str>,
        gate: &mut ChunkGate<'_, '_>,
        delivered: &AtomicBool,
        cancel: &CancellationToken,
    ) -> Result<Option<TokenUsage>, LlmError> {
        let name = adapter.name();
        let cancelled = || LlmError::new(LlmErrorKind::Cancelled, name, "stream cancelled by caller");
        let mut delays = self.retry.backoff();
        let mut attempt = 1u32;

        loop {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            tracing::debug!(provider = name, attempt, user_id, "Opening completion stream");

            let outcome = {
                let mut forward = |chunk: StreamChunk| gate.forward(chunk);
                let call = adapter.stream(request, credential, &mut forward);
                let deadline = first_chunk_deadline(self.request_timeout, delivered);
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(cancelled()),
                    _ = deadline => Err(self.timed_out(name)),
                    outcome = call => outcome,
                };
                self.record(name, outcome)
            };

            let e = match outcome {
                Ok(usage) => return Ok(usage),
                Err(e) => e,
            };

            if delivered.load(Ordering::Acquire) {
                tracing::warn!(provider = name, kind = %e.kind, error = %e.message, "Stream failed after first chunk");
                return Err(e);
            }
            if !e.is_retryable() {
                return Err(e);
            }
            let Some(step) = delays.next() else {
                tracing::warn!(provider = name, attempt, kind = %e.kind, "Retries exhausted");
                return Err(e);
            };

            let delay = self.retry.wait_for(step, e.retry_after);
            tracing::warn!(
                provider = name,
                attempt,
                delay = ?delay,
                kind = %e.kind,
                error = %e.message,
                "Retrying stream before first chunk"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Adapter and credential for `provider`, or the error that stops the
    /// call before any network traffic.
    async fn prepare(
        &self,
        provider: &str,
    ) -> Result<(Arc<dyn ProviderAdapter>, ApiCredential), LlmError> {
        let adapter = self.registry.get(provider).ok_or_else(|| {
            LlmError::new(
                LlmErrorKind::InvalidRequest,
                provider,
                format!(
                    "unknown provider; available: {}",
                    self.registry.available_types().join(", ")
                ),
            )
        })?;
        let name = adapter.name().to_string();

        let Some(secret) = self.vault.get_key(&name).await else {
            tracing::warn!(provider = %name, "No valid API key stored");
            return Err(LlmError::new(
                LlmErrorKind::Authentication,
                name,
                "no valid API key stored for provider",
            ));
        };

        if self.circuit_breaker.is_open(&name) {
            tracing::warn!(provider = %name, "Circuit open, failing fast");
            return Err(LlmError::new(
                LlmErrorKind::ServerError,
                name,
                "provider circuit open after repeated failures",
            ));
        }

        let credential = ApiCredential::from_vault(name, secret);
        Ok((adapter, credential))
    }

    /// One adapter call under the request deadline, feeding the breaker.
    async fn attempt<T>(
        &self,
        provider: &str,
        call: impl Future<Output = Result<T, LlmError>>,
    ) -> Result<T, LlmError> {
        let outcome = match tokio::time::timeout(self.request_timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.timed_out(provider)),
        };
        self.record(provider, outcome)
    }

    /// Feed one attempt's outcome to the circuit breaker.
    fn record<T>(&self, provider: &str, outcome: Result<T, LlmError>) -> Result<T, LlmError> {
        match &outcome {
            Ok(_) => self.circuit_breaker.record_success(provider),
            Err(e) if e.is_retryable() => self.circuit_breaker.record_failure(provider),
            Err(_) => {}
        }
        outcome
    }

    fn timed_out(&self, provider: &str) -> LlmError {
        LlmError::new(
            LlmErrorKind::Timeout,
            provider,
            format!(
                "no response within {}",
                humantime::format_duration(self.request_timeout)
            ),
        )
    }
}

/// Resolves once `timeout` passes without a delivered chunk; pends forever
/// after the first chunk.
async fn first_chunk_deadline(timeout: Duration, delivered: &AtomicBool) {
    tokio::time::sleep(timeout).await;
    if delivered.load(Ordering::Acquire) {
        std::future::pending::<()>().await;
    }
}

fn tokens_per_second(tokens: u32, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    (tokens > 0 && secs > 0.0).then(|| f64::from(tokens) / secs)
}

/// Forwards chunks to the caller, enforcing a single final chunk.
struct ChunkGate<'s, 'a> {
    sink: &'s mut ChunkSink<'a>,
    delivered: &'s AtomicBool,
    finished: bool,
}

impl ChunkGate<'_, '_> {
    fn forward(&mut self, chunk: StreamChunk) {
        if self.finished {
            return;
        }
        if chunk.is_final {
            self.finished = true;
        } else if chunk.text.is_empty() {
            return;
        } else {
            self.delivered.store(true, Ordering::Release);
        }
        (self.sink)(chunk);
    }

    fn finish(&mut self) {
        self.forward(StreamChunk::done());
    }

    fn fail(&mut self, error: LlmError) {
        self.forward(StreamChunk::failed(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keyrelay_core::{CacheMode, MemoryKeyStore};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    /// One step of a scripted stream.
    #[derive(Clone)]
    enum Step {
        Chunk(&'static str),
        Wait(u64),
        Fail(LlmErrorKind),
        Done,
    }

    /// Adapter that replays one script per call.
    struct ScriptedAdapter {
        scripts: Mutex<VecDeque<Vec<Step>>>,
        calls: AtomicU32,
    }

    impl ScriptedAdapter {
        fn new(scripts: Vec<Vec<Step>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn next_script(&self) -> Vec<Step> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.scripts.lock().pop_front().unwrap_or_else(|| vec![Step::Done])
        }
    }

    fn fail(kind: LlmErrorKind) -> LlmError {
        LlmError::new(kind, "scripted", "scripted failure")
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn name(&self) -> &str {
            "scripted"
        }

        fn default_model(&self) -> &str {
            "scripted-1"
        }

        async fn complete(
            &self,
            request: &CompletionRequest,
            credential: &ApiCredential,
        ) -> Result<CompletionResult, LlmError> {
            assert_eq!(credential.expose(), "sk-scripted-key");
            let mut text = String::new();
            for step in self.next_script() {
                match step {
                    Step::Chunk(t) => text.push_str(t),
                    Step::Wait(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                    Step::Fail(kind) => return Err(fail(kind)),
                    Step::Done => break,
                }
            }
            Ok(CompletionResult {
                text,
                usage: TokenUsage::new(4, 10),
                provider: "scripted".to_string(),
                model: request.model_or(self.default_model()).to_string(),
                metrics: None,
            })
        }

        async fn stream(
            &self,
            _request: &CompletionRequest,
            _credential: &ApiCredential,
            on_chunk: &mut ChunkSink<'_>,
        ) -> Result<Option<TokenUsage>, LlmError> {
            for step in self.next_script() {
                match step {
                    Step::Chunk(t) => on_chunk(StreamChunk::text(t)),
                    Step::Wait(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                    Step::Fail(kind) => return Err(fail(kind)),
                    Step::Done => {
                        on_chunk(StreamChunk::done());
                        return Ok(Some(TokenUsage::new(3, 2)));
                    }
                }
            }
            Err(fail(LlmErrorKind::ServerError))
        }
    }

    async fn orchestrator(adapter: Arc<ScriptedAdapter>, with_key: bool) -> Orchestrator {
        let vault = Arc::new(
            KeyVault::new(&[7u8; 32], Arc::new(MemoryKeyStore::new()), CacheMode::default())
                .unwrap(),
        );
        if with_key {
            assert!(vault.store_key("scripted", "sk-scripted-key", None).await);
        }
        let mut registry = ProviderRegistry::new();
        registry.register(adapter);
        Orchestrator::new(vault, registry, &RuntimeConfig::default())
    }

    async fn collect_stream(
        orch: &Orchestrator,
        cancel: &CancellationToken,
    ) -> (Result<Option<TokenUsage>, LlmError>, Vec<StreamChunk>) {
        let mut chunks = Vec::new();
        let result = orch
            .stream_complete(
                "scripted",
                &CompletionRequest::new("", "Hi"),
                None,
                &mut |chunk| chunks.push(chunk),
                cancel,
            )
            .await;
        (result, chunks)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_twice_then_success() {
        let adapter = ScriptedAdapter::new(vec![
            vec![Step::Fail(LlmErrorKind::RateLimit)],
            vec![Step::Fail(LlmErrorKind::RateLimit)],
            vec![Step::Chunk("ok"), Step::Done],
        ]);
        let orch = orchestrator(adapter.clone(), true).await;

        let result = orch
            .complete("scripted", &CompletionRequest::new("", "Hi"), Some("user-1"))
            .await
            .unwrap();

        assert_eq!(result.text, "ok");
        assert_eq!(result.model, "scripted-1");
        assert_eq!(adapter.calls(), 3);
        let metrics = result.metrics.unwrap();
        assert!(metrics.total_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_capped_at_max_attempts() {
        let adapter = ScriptedAdapter::new(vec![
            vec![Step::Fail(LlmErrorKind::ServerError)],
            vec![Step::Fail(LlmErrorKind::ServerError)],
            vec![Step::Fail(LlmErrorKind::ServerError)],
            vec![Step::Chunk("too late"), Step::Done],
        ]);
        let orch = orchestrator(adapter.clone(), true).await;

        let err = orch
            .complete("scripted", &CompletionRequest::new("", "Hi"), None)
            .await
            .unwrap_err();

        assert_eq!(err.kind, LlmErrorKind::ServerError);
        assert_eq!(adapter.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_request_not_retried() {
        let adapter = ScriptedAdapter::new(vec![vec![Step::Fail(LlmErrorKind::InvalidRequest)]]);
        let orch = orchestrator(adapter.clone(), true).await;

        let err = orch
            .complete("scripted", &CompletionRequest::new("", "Hi"), None)
            .await
            .unwrap_err();

        assert_eq!(err.kind, LlmErrorKind::InvalidRequest);
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_network() {
        let adapter = ScriptedAdapter::new(vec![]);
        let orch = orchestrator(adapter.clone(), false).await;

        let err = orch
            .complete("scripted", &CompletionRequest::new("", "Hi"), None)
            .await
            .unwrap_err();

        assert_eq!(err.kind, LlmErrorKind::Authentication);
        assert_eq!(adapter.calls(), 0);

        let (result, chunks) = collect_stream(&orch, &CancellationToken::new()).await;
        assert_eq!(result.unwrap_err().kind, LlmErrorKind::Authentication);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_final);
        assert_eq!(chunks[0].error.as_ref().unwrap().kind, LlmErrorKind::Authentication);
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let orch = orchestrator(ScriptedAdapter::new(vec![]), true).await;
        let err = orch
            .complete("mistral", &CompletionRequest::new("", "Hi"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::InvalidRequest);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried() {
        let adapter = ScriptedAdapter::new(vec![
            vec![Step::Wait(120_000), Step::Done],
            vec![Step::Chunk("fast"), Step::Done],
        ]);
        let orch = orchestrator(adapter.clone(), true).await;

        let result = orch
            .complete("scripted", &CompletionRequest::new("", "Hi"), None)
            .await
            .unwrap();

        assert_eq!(result.text, "fast");
        assert_eq!(adapter.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_retried_before_first_chunk() {
        let adapter = ScriptedAdapter::new(vec![
            vec![Step::Fail(LlmErrorKind::RateLimit)],
            vec![Step::Chunk("a"), Step::Chunk("b"), Step::Done],
        ]);
        let orch = orchestrator(adapter.clone(), true).await;

        let (result, chunks) = collect_stream(&orch, &CancellationToken::new()).await;

        assert_eq!(result.unwrap(), Some(TokenUsage::new(3, 2)));
        let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", ""]);
        assert_eq!(chunks.iter().filter(|c| c.is_final).count(), 1);
        assert_eq!(adapter.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_outlives_request_timeout_after_first_chunk() {
        let adapter = ScriptedAdapter::new(vec![vec![
            Step::Chunk("a"),
            Step::Wait(120_000),
            Step::Chunk("b"),
            Step::Done,
        ]]);
        let orch = orchestrator(adapter.clone(), true).await;

        let (result, chunks) = collect_stream(&orch, &CancellationToken::new()).await;

        assert_eq!(result.unwrap(), Some(TokenUsage::new(3, 2)));
        let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", ""]);
        assert!(chunks[2].is_final && chunks[2].error.is_none());
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_times_out_without_first_chunk() {
        let mut config = RuntimeConfig::default();
        config.retry = RetryPolicy::none();
        let adapter = ScriptedAdapter::new(vec![vec![Step::Wait(120_000), Step::Chunk("a"), Step::Done]]);
        let vault = Arc::new(
            KeyVault::new(&[7u8; 32], Arc::new(MemoryKeyStore::new()), CacheMode::default())
                .unwrap(),
        );
        vault.store_key("scripted", "sk-scripted-key", None).await;
        let mut registry = ProviderRegistry::new();
        registry.register(adapter.clone());
        let orch = Orchestrator::new(vault, registry, &config);

        let (result, chunks) = collect_stream(&orch, &CancellationToken::new()).await;

        assert_eq!(result.unwrap_err().kind, LlmErrorKind::Timeout);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].error.as_ref().unwrap().kind, LlmErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mid_stream_error_is_terminal() {
        let adapter = ScriptedAdapter::new(vec![
            vec![Step::Chunk("a"), Step::Fail(LlmErrorKind::ServerError)],
            vec![Step::Chunk("a"), Step::Done],
        ]);
        let orch = orchestrator(adapter.clone(), true).await;

        let (result, chunks) = collect_stream(&orch, &CancellationToken::new()).await;

        assert_eq!(result.unwrap_err().kind, LlmErrorKind::ServerError);
        assert_eq!(adapter.calls(), 1);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "a");
        assert!(chunks[1].is_final);
        assert_eq!(chunks[1].error.as_ref().unwrap().kind, LlmErrorKind::ServerError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_stream() {
        let adapter = ScriptedAdapter::new(vec![vec![
            Step::Chunk("a"),
            Step::Wait(1_000),
            Step::Chunk("b"),
            Step::Done,
        ]]);
        let orch = orchestrator(adapter.clone(), true).await;
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            })
        };
        let (result, chunks) = collect_stream(&orch, &cancel).await;
        canceller.await.unwrap();

        assert_eq!(result.unwrap_err().kind, LlmErrorKind::Cancelled);
        let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["a", ""]);
        assert_eq!(chunks[1].error.as_ref().unwrap().kind, LlmErrorKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_and_fails_fast() {
        let mut config = RuntimeConfig::default();
        config.retry = RetryPolicy::none();
        config.circuit_breaker.failure_threshold = 2;

        let adapter = ScriptedAdapter::new(vec![
            vec![Step::Fail(LlmErrorKind::ServerError)],
            vec![Step::Fail(LlmErrorKind::ServerError)],
        ]);
        let vault = Arc::new(
            KeyVault::new(&[7u8; 32], Arc::new(MemoryKeyStore::new()), CacheMode::default())
                .unwrap(),
        );
        vault.store_key("scripted", "sk-scripted-key", None).await;
        let mut registry = ProviderRegistry::new();
        registry.register(adapter.clone());
        let orch = Orchestrator::new(vault, registry, &config);

        let request = CompletionRequest::new("", "Hi");
        for _ in 0..2 {
            assert!(orch.complete("scripted", &request, None).await.is_err());
        }
        let err = orch.complete("scripted", &request, None).await.unwrap_err();

        assert_eq!(err.kind, LlmErrorKind::ServerError);
        assert!(err.message.contains("circuit"));
        assert_eq!(adapter.calls(), 2);
    }

    #[test]
    fn test_gate_suppresses_after_final() {
        let mut seen = Vec::new();
        let delivered = AtomicBool::new(false);
        {
            let mut sink = |chunk: StreamChunk| seen.push(chunk);
            let mut gate = ChunkGate {
                sink: &mut sink,
                delivered: &delivered,
                finished: false,
            };
            gate.forward(StreamChunk::text(""));
            gate.forward(StreamChunk::text("x"));
            gate.finish();
            gate.forward(StreamChunk::text("late"));
            gate.fail(fail(LlmErrorKind::Unknown));
        }
        assert!(delivered.load(Ordering::SeqCst));
        assert_eq!(seen.len(), 2);
        assert!(seen[1].is_final && seen[1].error.is_none());
    }

    #[test]
    fn test_tokens_per_second() {
        assert_eq!(tokens_per_second(100, Duration::from_secs(2)), Some(50.0));
        assert_eq!(tokens_per_second(0, Duration::from_secs(2)), None);
        assert_eq!(tokens_per_second(10, Duration::ZERO), None);
    }
}
