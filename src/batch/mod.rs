//! Batch, record and outcome types.
//!
//! This module re-exports types from `domain::batch`, `domain::record` and
//! `domain::outcome`. See those modules for the actual implementations.

pub use crate::domain::batch::{
    Batch, BatchId, BatchState, Provider, RemoteBatchSummary, RunId,
};
pub use crate::domain::outcome::{Outcome, OutcomeStatus, OutcomeSummary, RawOutcome, RawResult};
pub use crate::domain::record::LifecycleRecord;
