//! Anthropic Message Batches adapter.
//!
//! Requests are translated from the OpenAI chat shape into Messages API params. Anthropic
//! restricts `custom_id` to `[a-zA-Z0-9_-]{1,64}`, so each request is sent under a
//! positional id (`req-{n}`, its index in the chunk) and mapped back through the batch's
//! ordered request ids when results are read.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{
    BatchLimits, Chunk, ProviderAdapter, ensure_completed, excerpt, join_url, oldest_first,
    parse_json, poll_error, submit_error, transient,
};
use crate::batch::{Batch, BatchId, BatchState, Provider, RawOutcome, RemoteBatchSummary};
use crate::credentials;
use crate::error::{BarrageError, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::request::{Request, RequestId};

/// Settings for the Anthropic adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnthropicConfig {
    pub base_url: String,
    pub api_key_env: String,
    /// Value of the `anthropic-version` header
    pub api_version: String,
    pub max_requests: usize,
    pub max_bytes: usize,
    pub timeout_ms: u64,
    /// `max_tokens` for requests that do not set one (the Messages API requires it)
    pub default_max_tokens: u64,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            api_version: "2023-06-01".to_string(),
            max_requests: 100_000,
            max_bytes: 256 * 1024 * 1024,
            timeout_ms: 120_000,
            default_max_tokens: 1024,
        }
    }
}

/// Adapter for the Anthropic Message Batches API.
#[derive(Clone)]
pub struct AnthropicAdapter<H: HttpClient> {
    http: H,
    config: AnthropicConfig,
    api_key: String,
}

impl<H: HttpClient> AnthropicAdapter<H> {
    pub fn new(http: H, config: AnthropicConfig, api_key: impl Into<String>) -> Self {
        Self {
            http,
            config,
            api_key: api_key.into(),
        }
    }

    pub fn from_env(http: H, config: AnthropicConfig) -> Result<Self> {
        let api_key = credentials::api_key(Provider::Anthropic, &config.api_key_env)?;
        Ok(Self::new(http, config, api_key))
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let request = request
            .header("x-api-key", self.api_key.clone())
            .header("anthropic-version", self.config.api_version.clone());
        self.http.execute(&request, self.config.timeout_ms).await
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.config.base_url, path)
    }

    /// Translate an OpenAI-style chat body into Messages API params.
    fn params(&self, request: &Request) -> Result<Value> {
        let invalid = |what: &str| {
            BarrageError::Validation(format!("request {} {}", request.id, what))
        };
        let body = request
            .payload
            .as_object()
            .ok_or_else(|| invalid("body is not a JSON object"))?;
        let model = request.model().ok_or_else(|| invalid("names no model"))?;
        let messages = body
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid("has no messages"))?;

        let mut system = Vec::new();
        let mut turns = Vec::new();
        for message in messages {
            let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
            let content = message.get("content").cloned().unwrap_or(Value::Null);
            if role == "system" || role == "developer" {
                system.push(text_of(&content));
            } else {
                turns.push(json!({"role": role, "content": content}));
            }
        }
        if turns.is_empty() {
            return Err(invalid("has no user or assistant messages"));
        }

        let mut params = Map::new();
        params.insert("model".to_string(), json!(model));
        params.insert("messages".to_string(), Value::Array(turns));
        let max_tokens = body
            .get("max_tokens")
            .or_else(|| body.get("max_completion_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(self.config.default_max_tokens);
        params.insert("max_tokens".to_string(), json!(max_tokens));
        if !system.is_empty() {
            params.insert("system".to_string(), json!(system.join("\n\n")));
        }
        for (from, to) in [("temperature", "temperature"), ("top_p", "top_p"), ("top_k", "top_k")] {
            if let Some(value) = body.get(from).filter(|v| !v.is_null()) {
                params.insert(to.to_string(), value.clone());
            }
        }
        match body.get("stop") {
            Some(Value::String(stop)) => {
                params.insert("stop_sequences".to_string(), json!([stop]));
            }
            Some(Value::Array(stops)) if !stops.is_empty() => {
                params.insert("stop_sequences".to_string(), Value::Array(stops.clone()));
            }
            _ => {}
        }
        Ok(Value::Object(params))
    }
}

/// Plain text of a message content (string or list of text parts).
fn text_of(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Map an Anthropic `processing_status`.
pub fn map_status(status: &str) -> Option<BatchState> {
    match status {
        "in_progress" | "canceling" => Some(BatchState::Running),
        "ended" => Some(BatchState::Completed),
        _ => None,
    }
}

/// Request id behind a positional wire id.
fn request_id_for<'a>(batch: &'a Batch, wire_id: &str) -> Option<&'a RequestId> {
    let position: usize = wire_id.strip_prefix("req-")?.parse().ok()?;
    batch.request_ids.get(position)
}

fn parse_result_line(batch: &Batch, line: &Value) -> Option<RawOutcome> {
    let wire_id = line.get("custom_id")?.as_str()?;
    let Some(request_id) = request_id_for(batch, wire_id) else {
        tracing::warn!(batch_id = %batch.batch_id, wire_id, "Result for an unknown position");
        return None;
    };
    let result = line.get("result")?;
    let outcome = match result.get("type").and_then(Value::as_str) {
        Some("succeeded") => RawOutcome::body(
            request_id.clone(),
            result.get("message").cloned().unwrap_or(Value::Null),
        ),
        Some("errored") => RawOutcome::error(
            request_id.clone(),
            result.get("error").cloned().unwrap_or(Value::Null),
        ),
        Some(other) => RawOutcome::error(request_id.clone(), json!({"type": other})),
        None => return None,
    };
    Some(outcome)
}

#[async_trait]
impl<H: HttpClient + 'static> ProviderAdapter for AnthropicAdapter<H> {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn limits(&self) -> BatchLimits {
        BatchLimits {
            max_requests: self.config.max_requests,
            max_bytes: self.config.max_bytes,
        }
    }

    /// Batches may mix models.
    fn partition_key(&self, _request: &Request) -> Option<String> {
        None
    }

    fn encode(&self, request: &Request, position: usize) -> Result<Value> {
        Ok(json!({
            "custom_id": format!("req-{}", position),
            "params": self.params(request)?,
        }))
    }

    #[tracing::instrument(skip(self, chunk), fields(chunk_index = chunk.index, requests = chunk.len()))]
    async fn submit_chunk(&self, chunk: &Chunk) -> Result<BatchId> {
        let body = json!({"requests": chunk.lines});
        let response = self
            .send(HttpRequest::post_json(self.url("/v1/messages/batches"), &body)?)
            .await
            .map_err(|e| BarrageError::Submission {
                chunk_index: chunk.index,
                message: format!("batch creation failed: {e}"),
            })?;
        if !response.is_success() {
            return Err(submit_error(Provider::Anthropic, chunk.index, &response));
        }
        parse_json(&response.body)
            .ok()
            .and_then(|body| body.get("id").and_then(Value::as_str).map(BatchId::from))
            .ok_or_else(|| BarrageError::Submission {
                chunk_index: chunk.index,
                message: format!("response has no id: {}", excerpt(&response.body)),
            })
    }

    #[tracing::instrument(skip(self, batch), fields(batch_id = %batch.batch_id))]
    async fn poll(&self, batch: &Batch) -> Result<BatchState> {
        let batch_id = &batch.batch_id;
        let response = self
            .send(HttpRequest::get(
                self.url(&format!("/v1/messages/batches/{}", batch_id)),
            ))
            .await
            .map_err(|e| transient(batch_id, e))?;
        if !response.is_success() {
            return Err(poll_error(Provider::Anthropic, batch_id, &response));
        }
        let resource = parse_json(&response.body)
            .map_err(|e| transient(batch_id, format!("unreadable batch: {e}")))?;
        let status = resource
            .get("processing_status")
            .and_then(Value::as_str)
            .unwrap_or_default();
        tracing::debug!(status, "Polled batch");
        map_status(status)
            .ok_or_else(|| transient(batch_id, format!("unrecognized processing status '{status}'")))
    }

    #[tracing::instrument(skip(self, batch), fields(batch_id = %batch.batch_id))]
    async fn fetch_results(&self, batch: &Batch) -> Result<Vec<RawOutcome>> {
        ensure_completed(batch)?;
        let batch_id = &batch.batch_id;
        let response = self
            .send(HttpRequest::get(
                self.url(&format!("/v1/messages/batches/{}/results", batch_id)),
            ))
            .await
            .map_err(|e| transient(batch_id, e))?;
        if !response.is_success() {
            return Err(poll_error(Provider::Anthropic, batch_id, &response));
        }

        let outcomes: Vec<RawOutcome> = response
            .body
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<Value>(line) {
                Ok(value) => parse_result_line(batch, &value),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable result line");
                    None
                }
            })
            .collect();

        tracing::info!(results = outcomes.len(), "Fetched batch results");
        Ok(outcomes)
    }

    async fn list(&self, limit: usize) -> Result<Vec<RemoteBatchSummary>> {
        let url = self.url(&format!("/v1/messages/batches?limit={}", limit));
        let response = self.send(HttpRequest::get(url)).await?;
        if !response.is_success() {
            return Err(match response.status {
                401 | 403 => BarrageError::Authentication(format!(
                    "anthropic rejected the API key: HTTP {}",
                    response.status
                )),
                status => BarrageError::Other(anyhow::anyhow!(
                    "listing batches failed: HTTP {}: {}",
                    status,
                    excerpt(&response.body)
                )),
            });
        }
        let body = parse_json(&response.body)?;
        let summaries: Vec<RemoteBatchSummary> = body
            .get("data")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|item| {
                Some(RemoteBatchSummary {
                    batch_id: BatchId::from(item.get("id")?.as_str()?),
                    status: item
                        .get("processing_status")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    created_at: item
                        .get("created_at")
                        .and_then(Value::as_str)
                        .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
                        .map(|ts| ts.with_timezone(&chrono::Utc)),
                })
            })
            .collect();
        Ok(oldest_first(summaries, limit))
    }
}
