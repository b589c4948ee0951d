//! Secure credential handling for provider adapters.
//!
//! Credentials travel from the vault to an adapter wrapped in
//! [`ApiCredential`]:
//!
//! - **No accidental logging**: `Debug` and `Display` print `[REDACTED]`
//! - **Memory safety**: the value is a `SecretString`, zeroed on drop
//! - **Explicit exposure**: adapters call `.expose()` only to set a header
//!
//! ## Usage
//!
//! ```ignore
//! let cred = ApiCredential::from_vault("openai", vault.get_key("openai").await?);
//!
//! request.bearer_auth(cred.expose());
//! ```

use secrecy::{ExposeSecret, SecretString};
use std::fmt;

/// Where a credential was loaded from.
///
/// Useful for debugging configuration without exposing the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Decrypted from the key vault
    Vault,
    /// Provided programmatically
    Programmatic,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Vault => write!(f, "vault"),
            CredentialSource::Programmatic => write!(f, "programmatic"),
        }
    }
}

/// A securely-stored provider API key.
pub struct ApiCredential {
    value: SecretString,
    source: CredentialSource,
    provider: String,
}

impl ApiCredential {
    /// Wrap a plain string value. It cannot be logged after this point.
    pub fn new(
        value: impl Into<String>,
        source: CredentialSource,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            value: SecretString::from(value.into()),
            source,
            provider: provider.into(),
        }
    }

    /// Wrap a secret returned by the vault without copying it through a
    /// plain `String`.
    pub fn from_vault(provider: impl Into<String>, secret: SecretString) -> Self {
        Self {
            value: secret,
            source: CredentialSource::Vault,
            provider: provider.into(),
        }
    }

    /// Expose the value for use in an API call.
    ///
    /// Only call this where the credential is actually needed (setting an
    /// HTTP header). Never store the exposed value.
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.value.expose_secret().is_empty()
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    /// Provider this credential belongs to.
    pub fn provider(&self) -> &str {
        &self.provider
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("value", &"[REDACTED]")
            .field("source", &self.source)
            .field("provider", &self.provider)
            .finish()
    }
}

impl fmt::Display for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} key from {} [REDACTED]", self.provider, self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_redacted_in_debug() {
        let secret = "sk-super-secret-key-12345";
        let cred = ApiCredential::new(secret, CredentialSource::Programmatic, "openai");

        let debug = format!("{:?}", cred);
        assert!(!debug.contains(secret), "Secret exposed in Debug!");
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_credential_redacted_in_display() {
        let secret = "sk-super-secret-key-12345";
        let cred = ApiCredential::from_vault("anthropic", SecretString::from(secret.to_string()));

        let display = format!("{}", cred);
        assert!(!display.contains(secret), "Secret exposed in Display!");
        assert!(display.contains("[REDACTED]"));
        assert!(display.contains("anthropic"));
        assert!(display.contains("vault"));
    }

    #[test]
    fn test_credential_expose() {
        let secret = "sk-super-secret-key-12345";
        let cred = ApiCredential::new(secret, CredentialSource::Programmatic, "openai");

        assert_eq!(cred.expose(), secret);
        assert_eq!(cred.provider(), "openai");
        assert!(!cred.is_empty());
    }

    #[test]
    fn test_vault_credential_keeps_secret_and_source() {
        let cred = ApiCredential::from_vault("gemini", SecretString::from("AIza-vault-key".to_string()));
        assert_eq!(cred.expose(), "AIza-vault-key");
        assert_eq!(cred.source(), CredentialSource::Vault);
        assert_eq!(cred.source().to_string(), "vault");
    }
}
