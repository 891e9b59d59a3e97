//! Error types for the batch lifecycle.

use thiserror::Error;

use crate::domain::batch::{BatchId, BatchState};

/// Result type alias using the barrage error type.
pub type Result<T> = std::result::Result<T, BarrageError>;

/// Main error type for batch submission, polling and reconciliation.
#[derive(Error, Debug)]
pub enum BarrageError {
    /// The provider rejected a chunk before any remote state existed.
    #[error("Submission rejected for chunk {chunk_index}: {message}")]
    Submission { chunk_index: usize, message: String },

    /// A poll failed in a way that is worth retrying (timeouts, 429, 5xx).
    #[error("Transient poll error for batch {batch_id}: {message}")]
    TransientPoll { batch_id: BatchId, message: String },

    /// The provider gave an answer that no amount of retrying will change.
    #[error("Permanent error for batch {batch_id}: {message}")]
    Permanent { batch_id: BatchId, message: String },

    /// Results were requested for a batch that has not completed.
    #[error("Results unavailable: batch {0} is in state '{1}', expected 'completed'")]
    ResultsUnavailable(BatchId, BatchState),

    /// Missing or rejected credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Batch not found in the lifecycle store
    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    /// Attempted to move a batch backwards or out of a terminal state
    #[error("Invalid state transition for batch {0}: '{1}' -> '{2}'")]
    InvalidTransition(BatchId, BatchState, BatchState),

    /// Validation error (e.g., invalid request file, duplicate ids)
    #[error("Validation error: {0}")]
    Validation(String),

    /// The provider accepted these batches but the lifecycle store could not record them
    #[error(
        "Submitted batches could not be recorded ({}): {source}",
        .batch_ids.iter().map(|id| id.0.as_str()).collect::<Vec<_>>().join(", ")
    )]
    Unrecorded {
        batch_ids: Vec<BatchId>,
        #[source]
        source: Box<BarrageError>,
    },

    /// Polling stopped because shutdown was requested
    #[error("Shutdown requested")]
    Shutdown,

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BarrageError {
    /// Whether the polling loop may try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BarrageError::TransientPoll { .. })
    }
}

/// Helpers for storing errors in the lifecycle record.
///
/// The record keeps the top-level message and its source chain so diagnostics survive a
/// restart even though the original error type does not.
pub mod error_serialization {
    use serde::{Deserialize, Serialize};

    /// Serialized error format that preserves error message and source chain.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SerializedError {
        /// The main error message
        pub message: String,
        /// Chain of source errors, if any
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub sources: Vec<String>,
    }

    impl SerializedError {
        /// Capture an error and every `source()` below it.
        pub fn capture(error: &(dyn std::error::Error + 'static)) -> Self {
            let mut sources = Vec::new();
            let mut next = error.source();
            while let Some(source) = next {
                sources.push(source.to_string());
                next = source.source();
            }
            Self {
                message: error.to_string(),
                sources,
            }
        }

        /// A plain diagnostic with no source chain.
        pub fn message(message: impl Into<String>) -> Self {
            Self {
                message: message.into(),
                sources: Vec::new(),
            }
        }
    }

    impl std::fmt::Display for SerializedError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.message)?;
            for source in &self.sources {
                write!(f, ": {}", source)?;
            }
            Ok(())
        }
    }

}
