//! API keys from the environment.

use crate::batch::Provider;
use crate::error::{BarrageError, Result};

/// Default environment variable holding a provider's API key.
pub fn default_env_var(provider: Provider) -> &'static str {
    match provider {
        Provider::OpenAI => "OPENAI_API_KEY",
        Provider::Anthropic => "ANTHROPIC_API_KEY",
        Provider::Gemini => "GEMINI_API_KEY",
    }
}

/// Read a provider's API key from `env_var`.
///
/// A missing or blank variable is an authentication error, raised before anything is
/// sent to the provider.
pub fn api_key(provider: Provider, env_var: &str) -> Result<String> {
    match std::env::var(env_var) {
        Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
        _ => Err(BarrageError::Authentication(format!(
            "{} API key not found: set {}",
            provider, env_var
        ))),
    }
}

/// Masked form of a key for display: first and last four characters.
pub fn mask(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_is_authentication_error() {
        let result = api_key(Provider::Gemini, "BARRAGE_TEST_KEY_THAT_IS_NEVER_SET");
        match result {
            Err(BarrageError::Authentication(message)) => {
                assert!(message.contains("BARRAGE_TEST_KEY_THAT_IS_NEVER_SET"));
                assert!(message.starts_with("gemini"));
            }
            other => panic!("expected authentication error, got {other:?}"),
        }
    }

    #[test]
    fn test_mask() {
        assert_eq!(mask("sk-abcdefghijklmnop"), "sk-a...mnop");
        assert_eq!(mask("short"), "*****");
        assert_eq!(mask(""), "");
    }
}
