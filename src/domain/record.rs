//! The persisted lifecycle record of a batch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::batch::{Batch, BatchState};
use crate::error::error_serialization::SerializedError;

/// Last known state of a batch plus the bookkeeping needed to resume polling.
///
/// State changes go through the transition methods in `lifecycle::transitions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub batch: Batch,
    /// Transient poll failures spent against the retry budget
    pub retry_count: u32,
    /// Polls made since submission (or since the last re-arm); drives the backoff delay
    #[serde(default)]
    pub polls: u32,
    /// Last state observed from (or confirmed with) the provider.
    ///
    /// Differs from `batch.state` only after a local decision (`PollTimeout`, or
    /// `Failed` forced by a permanent poll error), and lets a timed-out batch be
    /// re-armed from where it stopped.
    pub last_remote_state: BatchState,
    /// Most recent retryable poll error, kept for diagnostics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<SerializedError>,
    pub updated_at: DateTime<Utc>,
}

impl LifecycleRecord {
    pub fn new(batch: Batch) -> Self {
        Self {
            last_remote_state: batch.state,
            batch,
            retry_count: 0,
            polls: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn state(&self) -> BatchState {
        self.batch.state
    }
}
