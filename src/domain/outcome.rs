//! Per-request outcomes.

use serde::{Deserialize, Serialize};

use super::batch::BatchId;
use super::request::RequestId;

/// A per-request result as returned by a provider, normalized by its adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOutcome {
    pub request_id: RequestId,
    pub result: RawResult,
}

/// What the provider said about one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RawResult {
    /// A result body (chat completion, message, generate-content response)
    Body(serde_json::Value),
    /// A per-request failure reported by the provider
    Error(serde_json::Value),
}

impl RawOutcome {
    pub fn body(request_id: impl Into<RequestId>, body: serde_json::Value) -> Self {
        Self {
            request_id: request_id.into(),
            result: RawResult::Body(body),
        }
    }

    pub fn error(request_id: impl Into<RequestId>, error: serde_json::Value) -> Self {
        Self {
            request_id: request_id.into(),
            result: RawResult::Error(error),
        }
    }
}

/// Final classification of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    ProviderError,
    Missing,
}

/// Reconciled result for one request. Exactly one exists per request of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub request_id: RequestId,
    pub status: OutcomeStatus,
    /// Batch that carried the request, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    /// Provider result body on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Provider error detail, or the reason the request is missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Counts over a set of outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeSummary {
    pub total: usize,
    pub succeeded: usize,
    pub provider_errors: usize,
    pub missing: usize,
}

impl OutcomeSummary {
    pub fn from_outcomes(outcomes: &[Outcome]) -> Self {
        let mut summary = Self {
            total: outcomes.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome.status {
                OutcomeStatus::Success => summary.succeeded += 1,
                OutcomeStatus::ProviderError => summary.provider_errors += 1,
                OutcomeStatus::Missing => summary.missing += 1,
            }
        }
        summary
    }

    /// Every request produced a successful result.
    pub fn is_complete(&self) -> bool {
        self.succeeded == self.total
    }
}
