//! The KeyRelay facade: the operations surfaced to the host application.

use std::sync::Arc;
use std::time::Duration;

use keyrelay_core::{
    normalize_provider, AggregationReader, ApiPerformanceMetrics, CipherError, CipherStore,
    DashboardData, FileKeyStore, JsonlLogStore, KeyVault, LlmPerformanceMetrics, LogStoreError,
    PerformanceAggregate, PerformanceLogStore, TimeWindow,
};
use secrecy::SecretString;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::{bootstrap_from_env, BootstrapReport};
use crate::config::{ConfigError, RuntimeConfig};
use crate::orchestrator::Orchestrator;
use crate::providers::{
    ChunkSink, CompletionRequest, CompletionResult, LlmError, ProviderRegistry, TokenUsage,
};
use crate::tracker::{PerformanceTracker, TrackedCall};

/// Errors raised while assembling a [`KeyRelay`].
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid master key: {0}")]
    MasterKey(#[from] CipherError),
}

/// Credential vault, provider orchestration and latency metrics behind one
/// handle.
pub struct KeyRelay {
    vault: Arc<KeyVault>,
    orchestrator: Orchestrator,
    tracker: PerformanceTracker,
    reader: AggregationReader,
}

impl std::fmt::Debug for KeyRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRelay")
            .field("vault", &self.vault)
            .field("orchestrator", &self.orchestrator)
            .finish()
    }
}

impl KeyRelay {
    /// Assemble from explicit parts.
    pub fn new(
        vault: Arc<KeyVault>,
        registry: ProviderRegistry,
        log_store: Arc<dyn PerformanceLogStore>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            orchestrator: Orchestrator::new(Arc::clone(&vault), registry, config),
            tracker: PerformanceTracker::new(Arc::clone(&log_store)),
            reader: AggregationReader::new(log_store),
            vault,
        }
    }

    /// File-backed vault and JSONL logs at the configured paths, with every
    /// compiled-in provider.
    pub fn from_config(master_key: &SecretString, config: &RuntimeConfig) -> Result<Self, SetupError> {
        use secrecy::ExposeSecret;

        let cipher = CipherStore::from_hex(master_key.expose_secret())?;
        let store = Arc::new(FileKeyStore::new(&config.vault_path));
        let vault = Arc::new(KeyVault::with_cipher(cipher, store, config.cache_mode()?));
        let log_store = Arc::new(JsonlLogStore::new(&config.log_dir));

        tracing::debug!(
            vault = %config.vault_path.display(),
            logs = %config.log_dir.display(),
            "KeyRelay initialized"
        );
        Ok(Self::new(
            vault,
            ProviderRegistry::with_defaults(config),
            log_store,
            config,
        ))
    }

    pub fn vault(&self) -> &Arc<KeyVault> {
        &self.vault
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn tracker(&self) -> &PerformanceTracker {
        &self.tracker
    }

    pub async fn store_key(&self, provider: &str, secret: &str, expires_in_days: Option<i64>) -> bool {
        self.vault.store_key(provider, secret, expires_in_days).await
    }

    pub async fn get_key(&self, provider: &str) -> Option<SecretString> {
        self.vault.get_key(provider).await
    }

    pub async fn remove_key(&self, provider: &str) -> bool {
        self.vault.remove_key(provider).await
    }

    pub async fn rotate_key(&self, provider: &str, new_secret: &str, expires_in_days: Option<i64>) -> bool {
        self.vault.rotate_key(provider, new_secret, expires_in_days).await
    }

    pub async fn list_providers(&self) -> Vec<String> {
        self.vault.list_providers().await
    }

    pub async fn has_valid_key(&self, provider: &str) -> bool {
        self.vault.has_valid_key(provider).await
    }

    /// Import `{PROVIDER}_API_KEY` variables for every registered provider.
    pub async fn bootstrap_from_env(&self) -> BootstrapReport {
        let providers = self.orchestrator.registry().available_types();
        bootstrap_from_env(&self.vault, &providers).await
    }

    /// Tracked blocking completion.
    pub async fn complete(
        &self,
        provider: &str,
        request: &CompletionRequest,
        user_id: Option<&str>,
    ) -> Result<CompletionResult, LlmError> {
        let name = normalize_provider(provider);
        let model = self.orchestrator.resolve_model(&name, request);
        let call = TrackedCall {
            provider: &name,
            model: &model,
            user_id,
            request: Some(request),
        };
        self.tracker
            .track_completion(call, self.orchestrator.complete(&name, request, user_id))
            .await
    }

    /// Tracked streaming completion. See [`Orchestrator::stream_complete`].
    pub async fn stream_complete(
        &self,
        provider: &str,
        request: &CompletionRequest,
        user_id: Option<&str>,
        on_chunk: &mut ChunkSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<Option<TokenUsage>, LlmError> {
        let name = normalize_provider(provider);
        let model = self.orchestrator.resolve_model(&name, request);
        let call = TrackedCall {
            provider: &name,
            model: &model,
            user_id,
            request: Some(request),
        };
        let orchestrator = &self.orchestrator;
        let provider = name.as_str();
        self.tracker
            .track_streaming_completion(call, on_chunk, |mut sink| async move {
                orchestrator
                    .stream_complete(provider, request, user_id, &mut *sink, cancel)
                    .await
            })
            .await
    }

    /// Log one request served by the host application.
    pub fn track_api_request(
        &self,
        endpoint: &str,
        method: &str,
        status_code: u16,
        duration: Duration,
        user_id: Option<&str>,
    ) {
        self.tracker
            .track_api_request(endpoint, method, status_code, duration, user_id);
    }

    pub async fn get_api_performance_metrics(
        &self,
        window: TimeWindow,
    ) -> Result<Vec<ApiPerformanceMetrics>, LogStoreError> {
        self.reader.api_performance_metrics(window).await
    }

    pub async fn get_llm_performance_metrics(
        &self,
        window: TimeWindow,
    ) -> Result<Vec<LlmPerformanceMetrics>, LogStoreError> {
        self.reader.llm_performance_metrics(window).await
    }

    pub async fn get_dashboard_data(&self, window: TimeWindow) -> Result<DashboardData, LogStoreError> {
        self.reader.dashboard_data(window).await
    }

    pub async fn get_aggregates(
        &self,
        window: TimeWindow,
    ) -> Result<Vec<PerformanceAggregate>, LogStoreError> {
        self.reader.aggregates(window).await
    }

    /// Wait for pending performance log writes.
    pub async fn flush(&self) {
        self.tracker.flush().await;
    }
}
