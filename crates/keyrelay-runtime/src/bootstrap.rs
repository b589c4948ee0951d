//! Startup credential import from `{PROVIDER}_API_KEY` variables.

use keyrelay_core::KeyVault;
use serde::Serialize;

/// Outcome of a bootstrap pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    /// Providers whose key was stored
    pub loaded: Vec<String>,
    /// Providers with no (or an empty) variable set
    pub missing: Vec<String>,
    /// Providers whose key could not be stored
    pub failed: Vec<String>,
}

/// Environment variable holding a provider's key: `OPENAI_API_KEY` etc.
pub fn api_key_var(provider: &str) -> String {
    format!("{}_API_KEY", provider.trim().to_uppercase().replace('-', "_"))
}

/// Store every `{PROVIDER}_API_KEY` found in the process environment.
pub async fn bootstrap_from_env<S: AsRef<str>>(vault: &KeyVault, providers: &[S]) -> BootstrapReport {
    bootstrap_from(vault, providers, |name| std::env::var(name).ok()).await
}

/// Like [`bootstrap_from_env`] with an explicit variable lookup.
pub async fn bootstrap_from<S, F>(vault: &KeyVault, providers: &[S], lookup: F) -> BootstrapReport
where
    S: AsRef<str>,
    F: Fn(&str) -> Option<String>,
{
    let mut report = BootstrapReport::default();

    for provider in providers {
        let provider = provider.as_ref();
        let var = api_key_var(provider);
        let Some(secret) = lookup(&var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) else {
            report.missing.push(provider.to_string());
            continue;
        };

        if vault.store_key(provider, &secret, None).await {
            tracing::info!(provider, source = %var, "Loaded API key from environment");
            report.loaded.push(provider.to_string());
        } else {
            report.failed.push(provider.to_string());
        }
    }

    report
}
