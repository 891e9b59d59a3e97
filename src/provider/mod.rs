//! Provider adapters.
//!
//! A `ProviderAdapter` turns a request set into provider-native batch submissions, polls
//! their remote state, and fetches raw results. Adapters hold no lifecycle state: every
//! operation is a function of the batch (or request set) it is given, and everything
//! provider-specific (wire shapes, status strings, id restrictions) stays behind the
//! trait.
//!
//! Three adapters exist, one per provider, plus `AnyAdapter` for choosing one at runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures::{Stream, StreamExt};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::batch::{Batch, BatchId, BatchState, Provider, RawOutcome, RemoteBatchSummary, RunId};
use crate::error::error_serialization::SerializedError;
use crate::error::{BarrageError, Result};
use crate::http::HttpResponse;
use crate::request::{Request, RequestSet};

pub mod anthropic;
pub mod any;
pub mod gemini;
pub mod openai;
pub mod partition;

pub use anthropic::{AnthropicAdapter, AnthropicConfig};
pub use any::AnyAdapter;
pub use gemini::{GeminiAdapter, GeminiConfig};
pub use openai::{OpenAIAdapter, OpenAIConfig};
pub use partition::{Chunk, partition};

/// Size limits of one provider batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLimits {
    /// Maximum number of requests in one batch
    pub max_requests: usize,
    /// Maximum encoded size of one batch in bytes (one JSON line per request)
    pub max_bytes: usize,
}

/// Uniform contract over the provider batch APIs.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    fn limits(&self) -> BatchLimits;

    /// Requests with different keys never share a batch.
    fn partition_key(&self, request: &Request) -> Option<String>;

    /// Encode one request as a line of the provider's batch input.
    ///
    /// `position` is the request's index within its chunk.
    fn encode(&self, request: &Request, position: usize) -> Result<serde_json::Value>;

    /// Submit one chunk and return the provider-assigned batch id.
    async fn submit_chunk(&self, chunk: &Chunk) -> Result<BatchId>;

    /// Query the remote state of a batch.
    ///
    /// Fails with `TransientPoll` when the query is worth retrying, and with `Permanent`
    /// or `Authentication` when it is not.
    async fn poll(&self, batch: &Batch) -> Result<BatchState>;

    /// Fetch per-request results. Only valid for `Completed` batches.
    async fn fetch_results(&self, batch: &Batch) -> Result<Vec<RawOutcome>>;

    /// The most recent `limit` batches of the account, oldest first.
    async fn list(&self, limit: usize) -> Result<Vec<RemoteBatchSummary>>;

    /// Split a request set into chunks that respect this provider's limits.
    fn chunks(&self, requests: &RequestSet) -> Vec<Chunk> {
        partition(
            requests,
            self.limits(),
            |request| self.partition_key(request),
            |request, position| self.encode(request, position),
        )
    }

    /// Submit one chunk.
    ///
    /// A chunk the provider refuses comes back in the `Rejected` state with the reason
    /// attached. Only `Authentication` is returned as an error: no other chunk can
    /// succeed with the same key.
    async fn submit_one(&self, run_id: RunId, chunk: &Chunk) -> Result<Batch> {
        let provider = self.provider();
        let submitted = match &chunk.rejection {
            Some(reason) => Err(BarrageError::Submission {
                chunk_index: chunk.index,
                message: reason.clone(),
            }),
            None => self.submit_chunk(chunk).await,
        };

        match submitted {
            Ok(batch_id) => {
                tracing::info!(
                    batch_id = %batch_id,
                    chunk_index = chunk.index,
                    requests = chunk.request_ids.len(),
                    bytes = chunk.bytes,
                    "Chunk submitted"
                );
                Ok(Batch {
                    batch_id,
                    provider,
                    state: BatchState::Submitted,
                    run_id,
                    chunk_index: chunk.index,
                    partition: chunk.partition.clone(),
                    submitted_at: Some(Utc::now()),
                    request_ids: chunk.request_ids.clone(),
                    error: None,
                })
            }
            Err(e @ BarrageError::Authentication(_)) => {
                tracing::error!(chunk_index = chunk.index, error = %e, "Submission refused credentials");
                Err(e)
            }
            Err(e) => {
                tracing::warn!(
                    chunk_index = chunk.index,
                    requests = chunk.request_ids.len(),
                    error = %e,
                    "Chunk rejected"
                );
                counter!("barrage_chunks_rejected_total", "provider" => provider.as_str())
                    .increment(1);
                let detail = match &e {
                    BarrageError::Submission { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                Ok(Batch {
                    batch_id: rejected_batch_id(run_id, chunk.index),
                    provider,
                    state: BatchState::Rejected,
                    run_id,
                    chunk_index: chunk.index,
                    partition: chunk.partition.clone(),
                    submitted_at: None,
                    request_ids: chunk.request_ids.clone(),
                    error: Some(SerializedError::message(detail)),
                })
            }
        }
    }

    /// Partition a request set and submit every chunk.
    ///
    /// Returns one batch per chunk, ordered by chunk index. A chunk the provider refuses
    /// is returned in the `Rejected` state; the other chunks are unaffected. An
    /// authentication failure stops the submission and is returned once the chunks
    /// already on the wire have finished.
    #[tracing::instrument(skip(self, requests), fields(provider = %self.provider(), run_id = %run_id, requests = requests.len()))]
    async fn submit(
        &self,
        run_id: RunId,
        requests: &RequestSet,
        concurrency: usize,
    ) -> Result<Vec<Batch>> {
        let chunks = self.chunks(requests);
        tracing::info!(chunks = chunks.len(), "Submitting request set");

        let resolved: Vec<Result<Option<Batch>>> = submit_chunks(self, run_id, &chunks, concurrency)
            .collect()
            .await;

        let mut batches = Vec::with_capacity(resolved.len());
        let mut auth_error = None;
        for result in resolved {
            match result {
                Ok(Some(batch)) => batches.push(batch),
                Ok(None) => {}
                Err(e) => {
                    auth_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = auth_error {
            return Err(e);
        }

        batches.sort_by_key(|batch| batch.chunk_index);
        Ok(batches)
    }
}

/// Submit chunks concurrently, yielding each batch as its chunk resolves.
///
/// Once a submission fails with `Authentication`, chunks that have not started yet are
/// skipped and yield `Ok(None)`; chunks already on the wire still complete.
pub fn submit_chunks<'a, A>(
    adapter: &'a A,
    run_id: RunId,
    chunks: &'a [Chunk],
    concurrency: usize,
) -> impl Stream<Item = Result<Option<Batch>>> + Send + 'a
where
    A: ProviderAdapter + ?Sized,
{
    let refused = Arc::new(AtomicBool::new(false));
    futures::stream::iter(chunks)
        .map(move |chunk| {
            let refused = refused.clone();
            async move {
                if refused.load(Ordering::SeqCst) {
                    tracing::debug!(chunk_index = chunk.index, "Chunk skipped after authentication failure");
                    return Ok(None);
                }
                match adapter.submit_one(run_id, chunk).await {
                    Ok(batch) => Ok(Some(batch)),
                    Err(e) => {
                        refused.store(true, Ordering::SeqCst);
                        Err(e)
                    }
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
}

/// Local id of a chunk that never reached the provider.
pub fn rejected_batch_id(run_id: RunId, chunk_index: usize) -> BatchId {
    BatchId(format!("rejected-{}-{}", run_id, chunk_index))
}

/// First part of a response body, for error messages.
pub(crate) fn excerpt(body: &str) -> String {
    const MAX: usize = 300;
    let body = body.trim();
    match body.char_indices().nth(MAX) {
        Some((end, _)) => format!("{}...", &body[..end]),
        None => body.to_string(),
    }
}

/// Classify a non-2xx response to a poll or fetch.
pub(crate) fn poll_error(provider: Provider, batch_id: &BatchId, response: &HttpResponse) -> BarrageError {
    let message = format!("HTTP {}: {}", response.status, excerpt(&response.body));
    match response.status {
        401 | 403 => BarrageError::Authentication(format!(
            "{} rejected the API key while polling batch {}: {}",
            provider, batch_id, message
        )),
        404 => BarrageError::Permanent {
            batch_id: batch_id.clone(),
            message: format!("batch not found ({})", message),
        },
        408 | 429 => BarrageError::TransientPoll {
            batch_id: batch_id.clone(),
            message,
        },
        status if status >= 500 => BarrageError::TransientPoll {
            batch_id: batch_id.clone(),
            message,
        },
        _ => BarrageError::Permanent {
            batch_id: batch_id.clone(),
            message,
        },
    }
}

/// Transport failures and unreadable bodies during a poll are worth retrying.
pub(crate) fn transient(batch_id: &BatchId, error: impl std::fmt::Display) -> BarrageError {
    BarrageError::TransientPoll {
        batch_id: batch_id.clone(),
        message: error.to_string(),
    }
}

/// Classify a non-2xx response to a submission.
pub(crate) fn submit_error(provider: Provider, chunk_index: usize, response: &HttpResponse) -> BarrageError {
    let message = format!("HTTP {}: {}", response.status, excerpt(&response.body));
    match response.status {
        401 | 403 => BarrageError::Authentication(format!(
            "{} rejected the API key: {}",
            provider, message
        )),
        _ => BarrageError::Submission {
            chunk_index,
            message,
        },
    }
}

/// Keep the `limit` most recent summaries, ordered oldest first.
///
/// Summaries without a creation time sort before every dated one.
pub(crate) fn oldest_first(
    mut summaries: Vec<RemoteBatchSummary>,
    limit: usize,
) -> Vec<RemoteBatchSummary> {
    summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let skip = summaries.len().saturating_sub(limit);
    summaries.split_off(skip)
}

/// Parse a successful JSON response body.
pub(crate) fn parse_json(body: &str) -> std::result::Result<serde_json::Value, serde_json::Error> {
    serde_json::from_str(body)
}

/// Fail with `ResultsUnavailable` unless the batch has completed.
pub(crate) fn ensure_completed(batch: &Batch) -> Result<()> {
    if batch.state != BatchState::Completed {
        return Err(BarrageError::ResultsUnavailable(
            batch.batch_id.clone(),
            batch.state,
        ));
    }
    Ok(())
}

/// Join a base URL and a path without doubling slashes.
pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
