//! Batch types: one provider-side submission covering a chunk of a request set.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::request::RequestId;
use crate::error::error_serialization::SerializedError;

/// Provider-assigned batch identifier.
///
/// Chunks rejected before reaching the provider get a local `rejected-...` id so they
/// can still be recorded and reported.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub String);

impl From<&str> for BatchId {
    fn from(id: &str) -> Self {
        BatchId(id.to_string())
    }
}

impl From<String> for BatchId {
    fn from(id: String) -> Self {
        BatchId(id)
    }
}

impl std::ops::Deref for BatchId {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one submission cycle of a request set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        RunId(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RunId {
    fn from(uuid: Uuid) -> Self {
        RunId(uuid)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(RunId)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Supported batch providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAI,
    Anthropic,
    Gemini,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::OpenAI, Provider::Anthropic, Provider::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAI),
            "anthropic" => Ok(Provider::Anthropic),
            "gemini" => Ok(Provider::Gemini),
            other => Err(format!(
                "unknown provider '{}' (expected openai, anthropic or gemini)",
                other
            )),
        }
    }
}

/// Lifecycle state of a batch.
///
/// ```text
/// Created ──submit──> Submitted ──poll──> Running ──poll──> Completed | Failed | Expired | Cancelled
///    │                    │                  │
///    └──rejected──> Rejected                 └──patience exhausted──> PollTimeout
/// ```
///
/// `PollTimeout` and `Rejected` are local: they never claim the provider failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Created,
    Submitted,
    Running,
    Completed,
    Failed,
    Expired,
    Cancelled,
    /// The local retry budget ran out before the provider reported a terminal state.
    PollTimeout,
    /// The provider refused the chunk; no remote batch exists.
    Rejected,
}

impl BatchState {
    /// Position in the lifecycle; transitions never decrease it.
    pub fn rank(self) -> u8 {
        match self {
            BatchState::Created => 0,
            BatchState::Submitted => 1,
            BatchState::Running => 2,
            BatchState::Completed
            | BatchState::Failed
            | BatchState::Expired
            | BatchState::Cancelled
            | BatchState::PollTimeout
            | BatchState::Rejected => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    /// Terminal states whose requests have no results to fetch.
    pub fn is_terminal_failure(self) -> bool {
        self.is_terminal() && self != BatchState::Completed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchState::Created => "created",
            BatchState::Submitted => "submitted",
            BatchState::Running => "running",
            BatchState::Completed => "completed",
            BatchState::Failed => "failed",
            BatchState::Expired => "expired",
            BatchState::Cancelled => "cancelled",
            BatchState::PollTimeout => "poll_timeout",
            BatchState::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One provider submission unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: BatchId,
    pub provider: Provider,
    pub state: BatchState,
    /// The run (request set submission) this batch belongs to
    pub run_id: RunId,
    /// Position of this chunk in the partitioning of its request set
    pub chunk_index: usize,
    /// Partition key the chunk was grouped under (usually the model)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    /// Requests carried by this batch, in submission order
    pub request_ids: Vec<RequestId>,
    /// Diagnostic attached when the batch failed, was rejected, or its results could not
    /// be fetched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
}

impl Batch {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Summary of a remote batch as listed by the provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteBatchSummary {
    pub batch_id: BatchId,
    /// Provider's own status string
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
}
