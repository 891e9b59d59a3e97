//! Result reconciliation.
//!
//! Maps raw provider outcomes back onto the original request set. Every request yields
//! exactly one `Outcome`, in input order: requests of batches that did not complete (or
//! whose results never arrived) are reported as `Missing` with the reason, never dropped.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;

use crate::batch::{Batch, BatchId, BatchState, Outcome, OutcomeStatus, RawOutcome, RawResult};
use crate::error::Result;
use crate::request::{RequestId, RequestSet};
use crate::store::file::write_atomic;

/// Reconcile raw results against the request set they came from.
///
/// Raw outcomes for ids a batch did not carry are ignored; for duplicated ids the first
/// one wins. The result is a pure function of the inputs.
pub fn reconcile(
    requests: &RequestSet,
    batches: &[Batch],
    raw_results: &HashMap<BatchId, Vec<RawOutcome>>,
) -> Vec<Outcome> {
    let mut owner: HashMap<&RequestId, &Batch> = HashMap::new();
    for batch in batches {
        for id in &batch.request_ids {
            if let Some(previous) = owner.get(id) {
                tracing::warn!(
                    request_id = %id,
                    batch_id = %batch.batch_id,
                    kept = %previous.batch_id,
                    "Request appears in more than one batch"
                );
                continue;
            }
            owner.insert(id, batch);
        }
    }

    // Per completed batch: request id -> first raw outcome
    let mut returned: HashMap<&BatchId, HashMap<&RequestId, &RawOutcome>> = HashMap::new();
    for batch in batches.iter().filter(|b| b.state == BatchState::Completed) {
        let Some(raw) = raw_results.get(&batch.batch_id) else {
            continue;
        };
        let by_id = returned.entry(&batch.batch_id).or_default();
        for outcome in raw {
            let belongs = owner
                .get(&outcome.request_id)
                .is_some_and(|b| b.batch_id == batch.batch_id);
            if !belongs {
                tracing::warn!(
                    batch_id = %batch.batch_id,
                    request_id = %outcome.request_id,
                    "Ignoring result for a request the batch did not carry"
                );
                continue;
            }
            if by_id.contains_key(&outcome.request_id) {
                tracing::warn!(
                    batch_id = %batch.batch_id,
                    request_id = %outcome.request_id,
                    "Ignoring duplicate result"
                );
                continue;
            }
            by_id.insert(&outcome.request_id, outcome);
        }
    }

    requests
        .iter()
        .map(|request| {
            let id = &request.id;
            let Some(batch) = owner.get(id) else {
                return missing(id, None, "not assigned to any batch".to_string());
            };
            let batch_id = Some(batch.batch_id.clone());
            let batch_error = batch.error.as_ref().map(|e| e.to_string());

            match batch.state {
                BatchState::Completed => match returned.get(&batch.batch_id) {
                    None => missing(
                        id,
                        batch_id,
                        match batch_error {
                            Some(error) => format!("results of batch {} could not be fetched: {}", batch.batch_id, error),
                            None => format!("results of batch {} were not fetched", batch.batch_id),
                        },
                    ),
                    Some(by_id) => match by_id.get(id) {
                        Some(raw) => classify(id, batch_id, raw),
                        None => missing(
                            id,
                            batch_id,
                            format!("absent from provider results of batch {}", batch.batch_id),
                        ),
                    },
                },
                BatchState::Rejected => missing(
                    id,
                    batch_id,
                    format!(
                        "submission rejected: {}",
                        batch_error.unwrap_or_else(|| "no reason given".to_string())
                    ),
                ),
                state if state.is_terminal() => missing(
                    id,
                    batch_id,
                    match batch_error {
                        Some(error) => format!("batch {} {}: {}", batch.batch_id, state, error),
                        None => format!("batch {} {}", batch.batch_id, state),
                    },
                ),
                state => missing(
                    id,
                    batch_id,
                    format!("batch {} still {}", batch.batch_id, state),
                ),
            }
        })
        .collect()
}

fn missing(id: &RequestId, batch_id: Option<BatchId>, reason: String) -> Outcome {
    Outcome {
        request_id: id.clone(),
        status: OutcomeStatus::Missing,
        batch_id,
        result: None,
        error: Some(reason),
    }
}

fn classify(id: &RequestId, batch_id: Option<BatchId>, raw: &RawOutcome) -> Outcome {
    match &raw.result {
        RawResult::Body(body) => Outcome {
            request_id: id.clone(),
            status: OutcomeStatus::Success,
            batch_id,
            result: Some(body.clone()),
            error: None,
        },
        RawResult::Error(detail) => Outcome {
            request_id: id.clone(),
            status: OutcomeStatus::ProviderError,
            batch_id,
            result: Some(detail.clone()),
            error: Some(describe(detail)),
        },
    }
}

/// Short human-readable form of a provider error payload.
fn describe(detail: &Value) -> String {
    const MESSAGE_PATHS: [&str; 4] = [
        "/message",
        "/error/message",
        "/error/error/message",
        "/body/error/message",
    ];
    if let Some(message) = MESSAGE_PATHS
        .iter()
        .find_map(|path| detail.pointer(path).and_then(Value::as_str))
    {
        return message.to_string();
    }
    if let Some(reason) = detail.get("reason").and_then(Value::as_str) {
        return match detail.get("blockReason").and_then(Value::as_str) {
            Some(block) => format!("{} ({})", reason, block),
            None => reason.to_string(),
        };
    }
    if let Some(kind) = detail.get("type").and_then(Value::as_str) {
        return kind.to_string();
    }
    detail.to_string()
}

/// Write outcomes as JSONL, one per line, atomically replacing `path`.
pub async fn write_outcomes(path: &Path, outcomes: &[Outcome]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }
    let mut content = Vec::new();
    for outcome in outcomes {
        serde_json::to_writer(&mut content, outcome)?;
        content.push(b'\n');
    }
    write_atomic(path, &content).await?;
    tracing::info!(path = %path.display(), outcomes = outcomes.len(), "Outcomes written");
    Ok(())
}
