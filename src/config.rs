//! Runtime configuration.
//!
//! Every field has a default, so a YAML file only needs the values it changes:
//!
//! ```yaml
//! state_dir: /var/lib/barrage
//! manager:
//!   poll_concurrency: 16
//!   backoff:
//!     backoff_ms: 10000
//! anthropic:
//!   default_max_tokens: 4096
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::batch::Provider;
use crate::error::{BarrageError, Result};
use crate::lifecycle::ManagerConfig;
use crate::provider::{AnthropicConfig, GeminiConfig, OpenAIConfig};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BarrageConfig {
    /// Directory holding `lifecycle.json`
    pub state_dir: PathBuf,
    /// Directory outcome files are written to
    pub output_dir: PathBuf,
    pub manager: ManagerConfig,
    pub openai: OpenAIConfig,
    pub anthropic: AnthropicConfig,
    pub gemini: GeminiConfig,
}

impl Default for BarrageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".barrage"),
            output_dir: PathBuf::from("."),
            manager: ManagerConfig::default(),
            openai: OpenAIConfig::default(),
            anthropic: AnthropicConfig::default(),
            gemini: GeminiConfig::default(),
        }
    }
}

impl BarrageConfig {
    /// Load from a YAML file, or defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            BarrageError::Validation(format!("{}: invalid configuration: {}", path.display(), e))
        })?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Environment variable holding the API key of `provider`.
    pub fn api_key_env(&self, provider: Provider) -> &str {
        match provider {
            Provider::OpenAI => &self.openai.api_key_env,
            Provider::Anthropic => &self.anthropic.api_key_env,
            Provider::Gemini => &self.gemini.api_key_env,
        }
    }

    /// Override the HTTP timeout of every provider.
    pub fn set_timeout_ms(&mut self, timeout_ms: u64) {
        self.openai.timeout_ms = timeout_ms;
        self.anthropic.timeout_ms = timeout_ms;
        self.gemini.timeout_ms = timeout_ms;
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| BarrageError::Other(e.into()))
    }
}
