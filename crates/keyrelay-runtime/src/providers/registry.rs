//! Static provider lookup table.
//!
//! The provider set is known at build time, so adapters are registered once
//! at startup and looked up by name on every call.
//!
//! ## Usage
//!
//! ```ignore
//! let registry = ProviderRegistry::with_defaults(&config);
//! let adapter = registry.get("openai").ok_or(...)?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use keyrelay_core::normalize_provider;

use super::ProviderAdapter;
use crate::config::RuntimeConfig;

/// Registry of provider adapters keyed by normalized provider name.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    adapters: BTreeMap<String, Arc<dyn ProviderAdapter>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.available_types())
            .finish()
    }
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own name.
    ///
    /// If an adapter with the same name already exists, it will be replaced.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters
            .insert(normalize_provider(adapter.name()), adapter);
    }

    /// Look up the adapter for a provider name (case-insensitive).
    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&normalize_provider(provider)).cloned()
    }

    /// List registered provider names.
    pub fn available_types(&self) -> Vec<&str> {
        self.adapters.keys().map(|s| s.as_str()).collect()
    }

    /// Check if a provider is registered.
    pub fn has_provider(&self, provider: &str) -> bool {
        self.adapters.contains_key(&normalize_provider(provider))
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Create a registry with every compiled-in adapter, applying the
    /// endpoint and default model overrides from `config`.
    #[cfg_attr(
        not(any(feature = "openai", feature = "anthropic", feature = "gemini")),
        allow(unused_variables)
    )]
    pub fn with_defaults(config: &RuntimeConfig) -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();

        #[cfg(feature = "openai")]
        registry.register_configured(
            config,
            super::OpenAiAdapter::new(),
            |a, url| a.with_base_url(url),
            |a, model| a.with_default_model(model),
        );

        #[cfg(feature = "anthropic")]
        registry.register_configured(
            config,
            super::AnthropicAdapter::new(),
            |a, url| a.with_base_url(url),
            |a, model| a.with_default_model(model),
        );

        #[cfg(feature = "gemini")]
        registry.register_configured(
            config,
            super::GeminiAdapter::new(),
            |a, url| a.with_base_url(url),
            |a, model| a.with_default_model(model),
        );

        registry
    }

    /// Register `adapter` after applying its `providers.<name>` settings.
    #[cfg(any(feature = "openai", feature = "anthropic", feature = "gemini"))]
    fn register_configured<A>(
        &mut self,
        config: &RuntimeConfig,
        mut adapter: A,
        base_url: impl FnOnce(A, &str) -> A,
        default_model: impl FnOnce(A, &str) -> A,
    ) where
        A: ProviderAdapter + 'static,
    {
        if let Some(settings) = config.provider(adapter.name()) {
            if let Some(url) = settings.base_url.as_deref() {
                adapter = base_url(adapter, url);
            }
            if let Some(model) = settings.default_model.as_deref() {
                adapter = default_model(adapter, model);
            }
        }
        self.register(Arc::new(adapter));
    }
}

#[cfg(all(test, feature = "all-providers"))]
mod tests {
    use super::*;
    use crate::config::ProviderSettings;

    #[test]
    fn test_defaults_register_builtin_providers() {
        let registry = ProviderRegistry::with_defaults(&RuntimeConfig::default());
        assert_eq!(registry.available_types(), vec!["anthropic", "gemini", "openai"]);
        assert!(registry.has_provider("OpenAI"));
        assert!(!registry.has_provider("mistral"));
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn test_default_models() {
        let registry = ProviderRegistry::with_defaults(&RuntimeConfig::default());
        assert_eq!(registry.get("openai").unwrap().default_model(), "gpt-4o-mini");
        assert_eq!(
            registry.get("anthropic").unwrap().default_model(),
            "claude-3-5-sonnet-latest"
        );
        assert_eq!(registry.get("gemini").unwrap().default_model(), "gemini-1.5-flash");
    }

    #[test]
    fn test_config_overrides_default_model() {
        let mut config = RuntimeConfig::default();
        for (provider, model) in [
            ("openai", "gpt-4o"),
            ("anthropic", "claude-3-opus-latest"),
            ("gemini", "gemini-1.5-pro"),
        ] {
            config.providers.insert(
                provider.to_string(),
                ProviderSettings {
                    base_url: Some("http://127.0.0.1:9".to_string()),
                    default_model: Some(model.to_string()),
                },
            );
        }
        let registry = ProviderRegistry::with_defaults(&config);
        assert_eq!(registry.get("openai").unwrap().default_model(), "gpt-4o");
        assert_eq!(
            registry.get("anthropic").unwrap().default_model(),
            "claude-3-opus-latest"
        );
        assert_eq!(registry.get("gemini").unwrap().default_model(), "gemini-1.5-pro");
    }

    #[test]
    fn test_register_replaces_existing() {
        let mut registry = ProviderRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(crate::providers::OpenAiAdapter::new()));
        registry.register(Arc::new(
            crate::providers::OpenAiAdapter::new().with_default_model("gpt-4o"),
        ));
        assert_eq!(registry.available_types().len(), 1);
        assert_eq!(registry.get("openai").unwrap().default_model(), "gpt-4o");
    }
}
