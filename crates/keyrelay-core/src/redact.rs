//! Shared patterns for provider names and credential scrubbing.
//!
//! Provider error bodies sometimes echo the key that was sent. Anything that
//! ends up in a log row goes through [`redact_secrets`] first.

use lazy_static::lazy_static;
use regex::Regex;

/// Replacement text for masked secrets.
pub const REDACTED: &str = "[REDACTED]";

lazy_static! {
    /// Normalized provider names: lower-case ASCII, digits, `_` and `-`.
    pub static ref PROVIDER_NAME_PATTERN: Regex = Regex::new(
        r"^[a-z0-9][a-z0-9_-]*$"
    ).unwrap();

    /// Vendor-prefixed keys: `sk-...`, `sk-ant-...`, `sk-proj-...`.
    pub static ref PREFIXED_KEY_PATTERN: Regex = Regex::new(
        r"\bsk-[A-Za-z0-9_-]{8,}"
    ).unwrap();

    /// Google API keys.
    pub static ref GOOGLE_KEY_PATTERN: Regex = Regex::new(
        r"\bAIza[0-9A-Za-z_-]{20,}"
    ).unwrap();

    /// `key=...`, `api_key: ...`, `Bearer ...` style assignments.
    pub static ref ASSIGNED_KEY_PATTERN: Regex = Regex::new(
        r#"(?i)\b(api[_-]?key|x-api-key|key|token|bearer)(["']?\s*[:=]\s*["']?|\s+)[A-Za-z0-9_\-\.]{16,}"#
    ).unwrap();
}

/// Check whether a normalized provider name is acceptable.
pub fn is_valid_provider_name(name: &str) -> bool {
    PROVIDER_NAME_PATTERN.is_match(name)
}

/// Mask API-key shaped substrings in free text.
pub fn redact_secrets(text: &str) -> String {
    let masked = PREFIXED_KEY_PATTERN.replace_all(text, REDACTED);
    let masked = GOOGLE_KEY_PATTERN.replace_all(&masked, REDACTED);
    ASSIGNED_KEY_PATTERN
        .replace_all(&masked, |caps: &regex::Captures<'_>| {
            format!("{}{}{}", &caps[1], &caps[2], REDACTED)
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_names() {
        assert!(is_valid_provider_name("openai"));
        assert!(is_valid_provider_name("azure-openai"));
        assert!(is_valid_provider_name("local_llm2"));
        assert!(!is_valid_provider_name(""));
        assert!(!is_valid_provider_name("-openai"));
        assert!(!is_valid_provider_name("Open AI"));
        assert!(!is_valid_provider_name("../etc"));
    }

    #[test]
    fn test_redacts_prefixed_keys() {
        let text = "Incorrect API key provided: sk-proj-abcdEFGH12345678.";
        let redacted = redact_secrets(text);
        assert!(!redacted.contains("abcdEFGH12345678"));
        assert!(redacted.contains(REDACTED));
    }

    #[test]
    fn test_redacts_google_keys() {
        let text = "API key not valid: AIzaSyA1234567890abcdefghijklmnop";
        let redacted = redact_secrets(text);
        assert!(!redacted.contains("AIzaSyA1234567890"));
    }

    #[test]
    fn test_redacts_assignments() {
        let text = "request failed with key=0123456789abcdef0123";
        let redacted = redact_secrets(text);
        assert_eq!(redacted, format!("request failed with key={}", REDACTED));
    }

    #[test]
    fn test_plain_text_untouched() {
        let text = "model overloaded, try again later";
        assert_eq!(redact_secrets(text), text);
    }
}
