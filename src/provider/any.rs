//! Adapter chosen at runtime.

use async_trait::async_trait;

use super::{
    AnthropicAdapter, BatchLimits, Chunk, GeminiAdapter, OpenAIAdapter, ProviderAdapter,
};
use crate::batch::{Batch, BatchId, BatchState, Provider, RawOutcome, RemoteBatchSummary};
use crate::config::BarrageConfig;
use crate::error::Result;
use crate::http::HttpClient;
use crate::request::Request;

/// One of the provider adapters.
#[derive(Clone)]
pub enum AnyAdapter<H: HttpClient> {
    OpenAI(OpenAIAdapter<H>),
    Anthropic(AnthropicAdapter<H>),
    Gemini(GeminiAdapter<H>),
}

impl<H: HttpClient> AnyAdapter<H> {
    /// Build the adapter for `provider`, reading its API key from the environment.
    ///
    /// Fails with `Authentication` when the key is not set.
    pub fn from_config(provider: Provider, http: H, config: &BarrageConfig) -> Result<Self> {
        Ok(match provider {
            Provider::OpenAI => Self::OpenAI(OpenAIAdapter::from_env(http, config.openai.clone())?),
            Provider::Anthropic => {
                Self::Anthropic(AnthropicAdapter::from_env(http, config.anthropic.clone())?)
            }
            Provider::Gemini => Self::Gemini(GeminiAdapter::from_env(http, config.gemini.clone())?),
        })
    }

    /// Set the description attached to OpenAI batches; other providers ignore it.
    pub fn with_description(self, description: Option<String>) -> Self {
        match self {
            Self::OpenAI(adapter) => Self::OpenAI(adapter.with_description(description)),
            other => other,
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $adapter:ident => $body:expr) => {
        match $self {
            AnyAdapter::OpenAI($adapter) => $body,
            AnyAdapter::Anthropic($adapter) => $body,
            AnyAdapter::Gemini($adapter) => $body,
        }
    };
}

#[async_trait]
impl<H: HttpClient + 'static> ProviderAdapter for AnyAdapter<H> {
    fn provider(&self) -> Provider {
        dispatch!(self, a => a.provider())
    }

    fn limits(&self) -> BatchLimits {
        dispatch!(self, a => a.limits())
    }

    fn partition_key(&self, request: &Request) -> Option<String> {
        dispatch!(self, a => a.partition_key(request))
    }

    fn encode(&self, request: &Request, position: usize) -> Result<serde_json::Value> {
        dispatch!(self, a => a.encode(request, position))
    }

    async fn submit_chunk(&self, chunk: &Chunk) -> Result<BatchId> {
        dispatch!(self, a => a.submit_chunk(chunk).await)
    }

    async fn poll(&self, batch: &Batch) -> Result<BatchState> {
        dispatch!(self, a => a.poll(batch).await)
    }

    async fn fetch_results(&self, batch: &Batch) -> Result<Vec<RawOutcome>> {
        dispatch!(self, a => a.fetch_results(batch).await)
    }

    async fn list(&self, limit: usize) -> Result<Vec<RemoteBatchSummary>> {
        dispatch!(self, a => a.list(limit).await)
    }
}
