//! OpenAI Batch API adapter.
//!
//! Submission is two calls: the chunk is uploaded as a JSONL file (`POST /v1/files`,
//! purpose `batch`), then a batch is created from it (`POST /v1/batches`). Results are
//! read from the batch's output and error files.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{
    BatchLimits, Chunk, ProviderAdapter, ensure_completed, join_url, oldest_first, parse_json,
    poll_error, submit_error, transient,
};
use crate::batch::{Batch, BatchId, BatchState, Provider, RawOutcome, RemoteBatchSummary};
use crate::credentials;
use crate::error::{BarrageError, Result};
use crate::http::{FilePart, HttpClient, HttpRequest, HttpResponse};
use crate::request::Request;

/// Settings for the OpenAI adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAIConfig {
    pub base_url: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub max_requests: usize,
    pub max_bytes: usize,
    /// Timeout of each HTTP call in milliseconds
    pub timeout_ms: u64,
    /// Time the provider is given to process a batch
    pub completion_window: String,
    /// Endpoint for requests that do not name one
    pub endpoint: String,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_requests: 50_000,
            max_bytes: 200 * 1024 * 1024,
            timeout_ms: 120_000,
            completion_window: "24h".to_string(),
            endpoint: "/v1/chat/completions".to_string(),
        }
    }
}

/// Adapter for the OpenAI Batch API.
#[derive(Clone)]
pub struct OpenAIAdapter<H: HttpClient> {
    http: H,
    config: OpenAIConfig,
    api_key: String,
    description: Option<String>,
}

impl<H: HttpClient> OpenAIAdapter<H> {
    pub fn new(http: H, config: OpenAIConfig, api_key: impl Into<String>) -> Self {
        Self {
            http,
            config,
            api_key: api_key.into(),
            description: None,
        }
    }

    /// Build the adapter with the API key named by `config.api_key_env`.
    pub fn from_env(http: H, config: OpenAIConfig) -> Result<Self> {
        let api_key = credentials::api_key(Provider::OpenAI, &config.api_key_env)?;
        Ok(Self::new(http, config, api_key))
    }

    /// Description stored in each batch's metadata.
    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let request = request.header("Authorization", format!("Bearer {}", self.api_key));
        self.http.execute(&request, self.config.timeout_ms).await
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.config.base_url, path)
    }

    fn endpoint_of<'a>(&'a self, request: &'a Request) -> &'a str {
        request.url.as_deref().unwrap_or(&self.config.endpoint)
    }

    /// Fetch the batch resource.
    async fn retrieve(&self, batch_id: &BatchId) -> Result<Value> {
        let response = self
            .send(HttpRequest::get(self.url(&format!("/v1/batches/{}", batch_id))))
            .await
            .map_err(|e| transient(batch_id, e))?;
        if !response.is_success() {
            return Err(poll_error(Provider::OpenAI, batch_id, &response));
        }
        parse_json(&response.body).map_err(|e| transient(batch_id, format!("unreadable batch: {e}")))
    }

    async fn file_content(&self, batch_id: &BatchId, file_id: &str) -> Result<String> {
        let response = self
            .send(HttpRequest::get(self.url(&format!("/v1/files/{}/content", file_id))))
            .await
            .map_err(|e| transient(batch_id, e))?;
        if !response.is_success() {
            return Err(poll_error(Provider::OpenAI, batch_id, &response));
        }
        Ok(response.body)
    }

    async fn upload(&self, chunk: &Chunk) -> Result<String> {
        let request = HttpRequest::post_multipart(
            self.url("/v1/files"),
            vec![("purpose".to_string(), "batch".to_string())],
            FilePart {
                field: "file".to_string(),
                filename: format!("barrage-chunk-{}.jsonl", chunk.index),
                mime: "application/jsonl".to_string(),
                content: chunk.to_jsonl().into_bytes(),
            },
        );
        let response = self.send(request).await.map_err(|e| BarrageError::Submission {
            chunk_index: chunk.index,
            message: format!("file upload failed: {e}"),
        })?;
        if !response.is_success() {
            return Err(submit_error(Provider::OpenAI, chunk.index, &response));
        }
        created_id(&response, chunk.index)
    }
}

/// Map an OpenAI batch status.
pub fn map_status(status: &str) -> Option<BatchState> {
    match status {
        "validating" => Some(BatchState::Submitted),
        "in_progress" | "finalizing" | "cancelling" => Some(BatchState::Running),
        "completed" => Some(BatchState::Completed),
        "failed" => Some(BatchState::Failed),
        "expired" => Some(BatchState::Expired),
        "cancelled" => Some(BatchState::Cancelled),
        _ => None,
    }
}

fn created_id(response: &HttpResponse, chunk_index: usize) -> Result<String> {
    parse_json(&response.body)
        .ok()
        .and_then(|body| body.get("id").and_then(Value::as_str).map(str::to_string))
        .ok_or_else(|| BarrageError::Submission {
            chunk_index,
            message: format!("response has no id: {}", super::excerpt(&response.body)),
        })
}

/// Classify one line of an output or error file.
fn parse_result_line(line: &Value) -> Option<RawOutcome> {
    let id = line.get("custom_id")?.as_str()?;

    if let Some(error) = line.get("error").filter(|error| !error.is_null()) {
        return Some(RawOutcome::error(id, error.clone()));
    }

    let Some(response) = line.get("response").filter(|r| !r.is_null()) else {
        return Some(RawOutcome::error(id, json!({"message": "no response"})));
    };
    let status = response
        .get("status_code")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let body = response.get("body").cloned().unwrap_or(Value::Null);
    if (1..400).contains(&status) && !body.is_null() {
        Some(RawOutcome::body(id, body))
    } else {
        Some(RawOutcome::error(
            id,
            json!({"status_code": status, "body": body}),
        ))
    }
}

#[async_trait]
impl<H: HttpClient + 'static> ProviderAdapter for OpenAIAdapter<H> {
    fn provider(&self) -> Provider {
        Provider::OpenAI
    }

    fn limits(&self) -> BatchLimits {
        BatchLimits {
            max_requests: self.config.max_requests,
            max_bytes: self.config.max_bytes,
        }
    }

    /// One model and one endpoint per batch.
    fn partition_key(&self, request: &Request) -> Option<String> {
        let model = request.model()?;
        let endpoint = self.endpoint_of(request);
        if endpoint == self.config.endpoint {
            Some(model.to_string())
        } else {
            Some(format!("{} {}", model, endpoint))
        }
    }

    fn encode(&self, request: &Request, _position: usize) -> Result<Value> {
        if !request.payload.is_object() {
            return Err(BarrageError::Validation(format!(
                "request {} body is not a JSON object",
                request.id
            )));
        }
        if request.model().is_none() {
            return Err(BarrageError::Validation(format!(
                "request {} names no model",
                request.id
            )));
        }
        Ok(json!({
            "custom_id": request.id.to_string(),
            "method": request.method.as_deref().unwrap_or("POST"),
            "url": self.endpoint_of(request),
            "body": request.payload,
        }))
    }

    #[tracing::instrument(skip(self, chunk), fields(chunk_index = chunk.index, requests = chunk.len()))]
    async fn submit_chunk(&self, chunk: &Chunk) -> Result<BatchId> {
        let file_id = self.upload(chunk).await?;
        tracing::debug!(file_id = %file_id, "Batch input uploaded");

        let endpoint = chunk
            .lines
            .first()
            .and_then(|line| line.get("url"))
            .and_then(Value::as_str)
            .unwrap_or(&self.config.endpoint)
            .to_string();
        let description = self
            .description
            .clone()
            .unwrap_or_else(|| format!("barrage chunk {}", chunk.index));
        let body = json!({
            "input_file_id": file_id,
            "endpoint": endpoint,
            "completion_window": self.config.completion_window,
            "metadata": {"description": description},
        });

        let response = self
            .send(HttpRequest::post_json(self.url("/v1/batches"), &body)?)
            .await
            .map_err(|e| BarrageError::Submission {
                chunk_index: chunk.index,
                message: format!("batch creation failed: {e}"),
            })?;
        if !response.is_success() {
            return Err(submit_error(Provider::OpenAI, chunk.index, &response));
        }
        created_id(&response, chunk.index).map(BatchId)
    }

    #[tracing::instrument(skip(self, batch), fields(batch_id = %batch.batch_id))]
    async fn poll(&self, batch: &Batch) -> Result<BatchState> {
        let resource = self.retrieve(&batch.batch_id).await?;
        let status = resource
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();
        tracing::debug!(status, "Polled batch");
        map_status(status).ok_or_else(|| {
            transient(&batch.batch_id, format!("unrecognized batch status '{status}'"))
        })
    }

    #[tracing::instrument(skip(self, batch), fields(batch_id = %batch.batch_id))]
    async fn fetch_results(&self, batch: &Batch) -> Result<Vec<RawOutcome>> {
        ensure_completed(batch)?;
        let resource = self.retrieve(&batch.batch_id).await?;

        let mut outcomes = Vec::new();
        for field in ["output_file_id", "error_file_id"] {
            let Some(file_id) = resource.get(field).and_then(Value::as_str) else {
                continue;
            };
            let content = self.file_content(&batch.batch_id, file_id).await?;
            for (n, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(line)
                    .ok()
                    .as_ref()
                    .and_then(parse_result_line)
                {
                    Some(outcome) => outcomes.push(outcome),
                    None => tracing::warn!(file_id, line = n + 1, "Skipping unreadable result line"),
                }
            }
        }

        tracing::info!(results = outcomes.len(), "Fetched batch results");
        Ok(outcomes)
    }

    async fn list(&self, limit: usize) -> Result<Vec<RemoteBatchSummary>> {
        let url = self.url(&format!("/v1/batches?limit={}", limit));
        let response = self.send(HttpRequest::get(url)).await?;
        if !response.is_success() {
            return Err(match response.status {
                401 | 403 => BarrageError::Authentication(format!(
                    "openai rejected the API key: HTTP {}",
                    response.status
                )),
                status => BarrageError::Other(anyhow::anyhow!(
                    "listing batches failed: HTTP {}: {}",
                    status,
                    super::excerpt(&response.body)
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
                        .get("status")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    created_at: item
                        .get("created_at")
                        .and_then(Value::as_i64)
                        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0)),
                })
            })
            .collect();
        Ok(oldest_first(summaries, limit))
    }
}
