//! Gemini Batch Mode adapter.
//!
//! Chunks are submitted with inlined requests to `models/{model}:batchGenerateContent`;
//! the batch is identified by the returned resource name (`batches/...`), and its
//! responses come back inlined in the same resource once it has succeeded. Each request
//! carries its id in `metadata.key`.

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
use crate::request::Request;

/// Settings for the Gemini adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub max_requests: usize,
    pub max_bytes: usize,
    pub timeout_ms: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            max_requests: 10_000,
            max_bytes: 20 * 1024 * 1024,
            timeout_ms: 120_000,
        }
    }
}

/// Adapter for the Gemini batch API.
#[derive(Clone)]
pub struct GeminiAdapter<H: HttpClient> {
    http: H,
    config: GeminiConfig,
    api_key: String,
}

/// Model name without routing prefixes (`gemini/`, `models/`).
pub fn normalize_model(model: &str) -> &str {
    let model = model.strip_prefix("gemini/").unwrap_or(model);
    model.strip_prefix("models/").unwrap_or(model)
}

/// Map a Gemini batch state (`BATCH_STATE_RUNNING`, `JOB_STATE_SUCCEEDED`, ...).
pub fn map_state(state: &str) -> Option<BatchState> {
    let suffix = state.rsplit_once("STATE_").map_or(state, |(_, s)| s);
    match suffix {
        "PENDING" => Some(BatchState::Submitted),
        "RUNNING" => Some(BatchState::Running),
        "SUCCEEDED" => Some(BatchState::Completed),
        "FAILED" => Some(BatchState::Failed),
        "CANCELLED" => Some(BatchState::Cancelled),
        "EXPIRED" => Some(BatchState::Expired),
        _ => None,
    }
}

fn parts_of(content: &Value) -> Vec<Value> {
    match content {
        Value::String(text) => vec![json!({"text": text})],
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .map(|text| json!({"text": text}))
            .collect(),
        _ => Vec::new(),
    }
}

fn state_of(resource: &Value) -> Option<&str> {
    resource
        .pointer("/metadata/state")
        .or_else(|| resource.get("state"))
        .and_then(Value::as_str)
}

fn inlined_responses(resource: &Value) -> Option<&Vec<Value>> {
    [
        "/response/inlinedResponses/inlinedResponses",
        "/metadata/output/inlinedResponses/inlinedResponses",
        "/output/inlinedResponses/inlinedResponses",
    ]
    .iter()
    .find_map(|pointer| resource.pointer(pointer).and_then(Value::as_array))
}

/// Classify one inlined response.
fn classify(request_id: &str, item: &Value) -> RawOutcome {
    if let Some(error) = item.get("error").filter(|e| !e.is_null()) {
        return RawOutcome::error(request_id, error.clone());
    }
    let response = item.get("response").cloned().unwrap_or(Value::Null);
    let has_candidates = response
        .get("candidates")
        .and_then(Value::as_array)
        .is_some_and(|candidates| !candidates.is_empty());
    if has_candidates {
        return RawOutcome::body(request_id, response);
    }
    match response.pointer("/promptFeedback/blockReason") {
        Some(reason) => RawOutcome::error(
            request_id,
            json!({"reason": "filtered", "blockReason": reason}),
        ),
        None => RawOutcome::error(
            request_id,
            json!({"reason": "no candidates", "response": response}),
        ),
    }
}

impl<H: HttpClient> GeminiAdapter<H> {
    pub fn new(http: H, config: GeminiConfig, api_key: impl Into<String>) -> Self {
        Self {
            http,
            config,
            api_key: api_key.into(),
        }
    }

    pub fn from_env(http: H, config: GeminiConfig) -> Result<Self> {
        let api_key = credentials::api_key(Provider::Gemini, &config.api_key_env)?;
        Ok(Self::new(http, config, api_key))
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let request = request.header("x-goog-api-key", self.api_key.clone());
        self.http.execute(&request, self.config.timeout_ms).await
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.config.base_url, path)
    }

    async fn retrieve(&self, batch_id: &BatchId) -> Result<Value> {
        let response = self
            .send(HttpRequest::get(self.url(&format!("/v1beta/{}", batch_id))))
            .await
            .map_err(|e| transient(batch_id, e))?;
        if !response.is_success() {
            return Err(poll_error(Provider::Gemini, batch_id, &response));
        }
        parse_json(&response.body).map_err(|e| transient(batch_id, format!("unreadable batch: {e}")))
    }

    /// Translate an OpenAI-style chat body into a `GenerateContentRequest`.
    fn generate_request(&self, request: &Request) -> Result<Value> {
        let invalid =
            |what: &str| BarrageError::Validation(format!("request {} {}", request.id, what));
        let body = request
            .payload
            .as_object()
            .ok_or_else(|| invalid("body is not a JSON object"))?;
        let messages = body
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid("has no messages"))?;

        let mut system_parts = Vec::new();
        let mut contents = Vec::new();
        for message in messages {
            let content = message.get("content").cloned().unwrap_or(Value::Null);
            match message.get("role").and_then(Value::as_str).unwrap_or("user") {
                "system" | "developer" => system_parts.extend(parts_of(&content)),
                "assistant" | "model" => {
                    contents.push(json!({"role": "model", "parts": parts_of(&content)}))
                }
                _ => contents.push(json!({"role": "user", "parts": parts_of(&content)})),
            }
        }
        if contents.is_empty() {
            return Err(invalid("has no user or assistant messages"));
        }

        let mut generate = Map::new();
        generate.insert("contents".to_string(), Value::Array(contents));
        if !system_parts.is_empty() {
            generate.insert(
                "systemInstruction".to_string(),
                json!({"parts": system_parts}),
            );
        }

        let mut config = Map::new();
        if let Some(max) = body
            .get("max_tokens")
            .or_else(|| body.get("max_completion_tokens"))
            .filter(|v| !v.is_null())
        {
            config.insert("maxOutputTokens".to_string(), max.clone());
        }
        for (from, to) in [
            ("temperature", "temperature"),
            ("top_p", "topP"),
            ("top_k", "topK"),
            ("n", "candidateCount"),
        ] {
            if let Some(value) = body.get(from).filter(|v| !v.is_null()) {
                config.insert(to.to_string(), value.clone());
            }
        }
        match body.get("stop") {
            Some(Value::String(stop)) => {
                config.insert("stopSequences".to_string(), json!([stop]));
            }
            Some(Value::Array(stops)) if !stops.is_empty() => {
                config.insert("stopSequences".to_string(), Value::Array(stops.clone()));
            }
            _ => {}
        }
        if !config.is_empty() {
            generate.insert("generationConfig".to_string(), Value::Object(config));
        }
        Ok(Value::Object(generate))
    }
}

#[async_trait]
impl<H: HttpClient + 'static> ProviderAdapter for GeminiAdapter<H> {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    fn limits(&self) -> BatchLimits {
        BatchLimits {
            max_requests: self.config.max_requests,
            max_bytes: self.config.max_bytes,
        }
    }

    /// One model per batch; the model is part of the submission URL.
    fn partition_key(&self, request: &Request) -> Option<String> {
        request.model().map(|model| normalize_model(model).to_string())
    }

    fn encode(&self, request: &Request, _position: usize) -> Result<Value> {
        if request.model().is_none() {
            return Err(BarrageError::Validation(format!(
                "request {} names no model",
                request.id
            )));
        }
        Ok(json!({
            "request": self.generate_request(request)?,
            "metadata": {"key": request.id.to_string()},
        }))
    }

    #[tracing::instrument(skip(self, chunk), fields(chunk_index = chunk.index, requests = chunk.len()))]
    async fn submit_chunk(&self, chunk: &Chunk) -> Result<BatchId> {
        let model = chunk.partition.as_deref().ok_or_else(|| BarrageError::Submission {
            chunk_index: chunk.index,
            message: "chunk has no model".to_string(),
        })?;
        let body = json!({
            "batch": {
                "display_name": format!("barrage-chunk-{}", chunk.index),
                "input_config": {"requests": {"requests": chunk.lines}},
            }
        });
        let url = self.url(&format!("/v1beta/models/{}:batchGenerateContent", model));

        let response = self
            .send(HttpRequest::post_json(url, &body)?)
            .await
            .map_err(|e| BarrageError::Submission {
                chunk_index: chunk.index,
                message: format!("batch creation failed: {e}"),
            })?;
        if !response.is_success() {
            return Err(submit_error(Provider::Gemini, chunk.index, &response));
        }
        parse_json(&response.body)
            .ok()
            .and_then(|body| body.get("name").and_then(Value::as_str).map(BatchId::from))
            .ok_or_else(|| BarrageError::Submission {
                chunk_index: chunk.index,
                message: format!("response has no batch name: {}", excerpt(&response.body)),
            })
    }

    #[tracing::instrument(skip(self, batch), fields(batch_id = %batch.batch_id))]
    async fn poll(&self, batch: &Batch) -> Result<BatchState> {
        let resource = self.retrieve(&batch.batch_id).await?;
        let state = state_of(&resource).unwrap_or_default();
        tracing::debug!(state, "Polled batch");
        map_state(state).ok_or_else(|| {
            transient(&batch.batch_id, format!("unrecognized batch state '{state}'"))
        })
    }

    #[tracing::instrument(skip(self, batch), fields(batch_id = %batch.batch_id))]
    async fn fetch_results(&self, batch: &Batch) -> Result<Vec<RawOutcome>> {
        ensure_completed(batch)?;
        let resource = self.retrieve(&batch.batch_id).await?;

        let Some(responses) = inlined_responses(&resource) else {
            tracing::warn!("Completed batch carries no inlined responses");
            return Ok(Vec::new());
        };

        let mut outcomes = Vec::with_capacity(responses.len());
        for (position, item) in responses.iter().enumerate() {
            let key = item
                .pointer("/metadata/key")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| batch.request_ids.get(position).map(|id| id.to_string()));
            match key {
                Some(key) => outcomes.push(classify(&key, item)),
                None => tracing::warn!(position, "Response cannot be matched to a request"),
            }
        }

        tracing::info!(results = outcomes.len(), "Fetched batch results");
        Ok(outcomes)
    }

    async fn list(&self, limit: usize) -> Result<Vec<RemoteBatchSummary>> {
        let url = self.url(&format!("/v1beta/batches?pageSize={}", limit));
        let response = self.send(HttpRequest::get(url)).await?;
        if !response.is_success() {
            return Err(match response.status {
                401 | 403 => BarrageError::Authentication(format!(
                    "gemini rejected the API key: HTTP {}",
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
        let items = body
            .get("operations")
            .or_else(|| body.get("batches"))
            .and_then(Value::as_array);
        let summaries: Vec<RemoteBatchSummary> = items
            .into_iter()
            .flatten()
            .filter_map(|item| {
                Some(RemoteBatchSummary {
                    batch_id: BatchId::from(item.get("name")?.as_str()?),
                    status: state_of(item).unwrap_or("unknown").to_string(),
                    created_at: item
                        .pointer("/metadata/createTime")
                        .or_else(|| item.get("createTime"))
                        .and_then(Value::as_str)
                        .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
                        .map(|ts| ts.with_timezone(&chrono::Utc)),
                })
            })
            .collect();
        Ok(oldest_first(summaries, limit))
    }
}
