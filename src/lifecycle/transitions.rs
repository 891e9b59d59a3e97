//! State transitions for lifecycle records.
//!
//! Every change to a batch's state goes through one of these methods, which enforce
//! that the lifecycle only moves forward:
//!
//! ```text
//! Created ─> Submitted ─> Running ─> Completed | Failed | Expired | Cancelled
//!                │            │
//!                └────────────┴──> PollTimeout ──rearm()──> last remote state
//! ```
//!
//! - `observe()` applies a state reported by the provider. Stale observations (a rank
//!   lower than the current state) are ignored rather than applied.
//! - `record_attempt()` spends one unit of the retry budget after a transient poll
//!   failure and parks the batch in `PollTimeout` once the budget is gone.
//! - `fail()` forces `Failed` after a non-retryable error.
//! - `rearm()` is the only way out of a terminal state, and only out of `PollTimeout`.

use chrono::Utc;
use metrics::counter;

use super::backoff::BackoffPolicy;
use crate::batch::{BatchState, LifecycleRecord};
use crate::error::error_serialization::SerializedError;
use crate::error::{BarrageError, Result};

impl LifecycleRecord {
    /// Apply a state reported by the provider.
    ///
    /// Returns `true` if the recorded state changed.
    pub fn observe(&mut self, observed: BatchState) -> Result<bool> {
        let current = self.batch.state;

        if matches!(
            observed,
            BatchState::Created | BatchState::PollTimeout | BatchState::Rejected
        ) {
            return Err(BarrageError::InvalidTransition(
                self.batch.batch_id.clone(),
                current,
                observed,
            ));
        }

        if current.is_terminal() {
            if observed == current {
                return Ok(false);
            }
            return Err(BarrageError::InvalidTransition(
                self.batch.batch_id.clone(),
                current,
                observed,
            ));
        }

        if observed.rank() < current.rank() {
            tracing::debug!(
                batch_id = %self.batch.batch_id,
                current = %current,
                observed = %observed,
                "Ignoring stale state observation"
            );
            return Ok(false);
        }

        if observed == current {
            return Ok(false);
        }

        self.batch.state = observed;
        self.last_remote_state = observed;
        self.updated_at = Utc::now();

        tracing::info!(
            batch_id = %self.batch.batch_id,
            provider = %self.batch.provider,
            from = %current,
            to = %observed,
            "Batch state changed"
        );
        if observed.is_terminal() {
            self.last_error = None;
            counter!(
                "barrage_batches_terminal_total",
                "provider" => self.batch.provider.as_str(),
                "state" => observed.as_str()
            )
            .increment(1);
        }
        Ok(true)
    }

    /// Spend one unit of the retry budget on a transient poll failure.
    ///
    /// Returns `true` if the budget is exhausted, in which case the batch has been
    /// moved to `PollTimeout`.
    pub fn record_attempt(&mut self, policy: &BackoffPolicy) -> bool {
        self.retry_count = self.retry_count.saturating_add(1);
        self.updated_at = Utc::now();
        if policy.is_exhausted(self.retry_count) && !self.batch.state.is_terminal() {
            self.time_out();
            return true;
        }
        false
    }

    /// Remember a retryable error without touching the state.
    pub fn note_transient(&mut self, error: &BarrageError) {
        self.last_error = Some(SerializedError::capture(error));
        self.updated_at = Utc::now();
    }

    /// Force the batch into `Failed` after a non-retryable error.
    pub fn fail(&mut self, error: &BarrageError) -> Result<()> {
        let current = self.batch.state;
        if current.is_terminal() {
            return Err(BarrageError::InvalidTransition(
                self.batch.batch_id.clone(),
                current,
                BatchState::Failed,
            ));
        }
        self.batch.state = BatchState::Failed;
        self.batch.error = Some(SerializedError::capture(error));
        self.updated_at = Utc::now();

        tracing::error!(
            batch_id = %self.batch.batch_id,
            provider = %self.batch.provider,
            from = %current,
            error = %error,
            "Batch failed permanently"
        );
        counter!(
            "barrage_batches_terminal_total",
            "provider" => self.batch.provider.as_str(),
            "state" => BatchState::Failed.as_str()
        )
        .increment(1);
        Ok(())
    }

    fn time_out(&mut self) {
        let message = match &self.last_error {
            Some(last) => format!(
                "retry budget exhausted after {} failed polls in state '{}' (last error: {})",
                self.retry_count, self.batch.state, last
            ),
            None => format!(
                "retry budget exhausted after {} failed polls in state '{}'",
                self.retry_count, self.batch.state
            ),
        };
        tracing::warn!(
            batch_id = %self.batch.batch_id,
            retry_count = self.retry_count,
            state = %self.batch.state,
            "Batch parked in poll_timeout"
        );
        self.batch.state = BatchState::PollTimeout;
        self.batch.error = Some(SerializedError::message(message));
        counter!(
            "barrage_batches_terminal_total",
            "provider" => self.batch.provider.as_str(),
            "state" => BatchState::PollTimeout.as_str()
        )
        .increment(1);
    }

    /// Attach a diagnostic without changing state (e.g. results could not be fetched).
    pub fn attach_error(&mut self, error: &BarrageError) {
        self.batch.error = Some(SerializedError::capture(error));
        self.updated_at = Utc::now();
    }

    /// Re-arm a batch parked in `PollTimeout` so polling can continue.
    ///
    /// Restores the last remote state and a fresh budget. Returns `false` for any other
    /// state.
    pub fn rearm(&mut self) -> bool {
        if self.batch.state != BatchState::PollTimeout {
            return false;
        }
        tracing::info!(
            batch_id = %self.batch.batch_id,
            state = %self.last_remote_state,
            "Re-arming timed out batch"
        );
        self.batch.state = self.last_remote_state;
        self.batch.error = None;
        self.retry_count = 0;
        self.polls = 0;
        self.last_error = None;
        self.updated_at = Utc::now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Batch, BatchId, Provider, RunId};

    fn record(state: BatchState) -> LifecycleRecord {
        LifecycleRecord::new(Batch {
            batch_id: BatchId::from("batch_1"),
            provider: Provider::OpenAI,
            state,
            run_id: RunId::new(),
            chunk_index: 0,
            partition: None,
            submitted_at: Some(Utc::now()),
            request_ids: vec!["a".into()],
            error: None,
        })
    }

    fn transient() -> BarrageError {
        BarrageError::TransientPoll {
            batch_id: BatchId::from("batch_1"),
            message: "503".to_string(),
        }
    }

    #[test]
    fn test_forward_transitions() {
        let mut rec = record(BatchState::Submitted);
        assert!(rec.observe(BatchState::Running).unwrap());
        assert!(!rec.observe(BatchState::Running).unwrap());
        assert!(rec.observe(BatchState::Completed).unwrap());
        assert_eq!(rec.state(), BatchState::Completed);
        assert_eq!(rec.last_remote_state, BatchState::Completed);
    }

    #[test]
    fn test_stale_observation_is_ignored() {
        let mut rec = record(BatchState::Running);
        assert!(!rec.observe(BatchState::Submitted).unwrap());
        assert_eq!(rec.state(), BatchState::Running);
    }

    #[test]
    fn test_terminal_state_cannot_change() {
        let mut rec = record(BatchState::Completed);
        assert!(!rec.observe(BatchState::Completed).unwrap());
        assert!(matches!(
            rec.observe(BatchState::Failed),
            Err(BarrageError::InvalidTransition(_, BatchState::Completed, BatchState::Failed))
        ));
        assert!(rec.fail(&transient()).is_err());
    }

    #[test]
    fn test_providers_cannot_report_local_states() {
        let mut rec = record(BatchState::Running);
        assert!(rec.observe(BatchState::PollTimeout).is_err());
        assert!(rec.observe(BatchState::Rejected).is_err());
    }

    #[test]
    fn test_budget_exhaustion_times_out_then_rearms() {
        let policy = BackoffPolicy::immediate(2);
        let mut rec = record(BatchState::Running);
        rec.polls = 9;
        rec.note_transient(&transient());
        assert!(!rec.record_attempt(&policy));
        assert_eq!(rec.state(), BatchState::Running);
        assert!(rec.record_attempt(&policy));
        assert_eq!(rec.state(), BatchState::PollTimeout);
        assert_eq!(rec.last_remote_state, BatchState::Running);
        let error = rec.batch.error.clone().unwrap();
        assert!(error.message.contains("retry budget exhausted after 2 failed polls"));
        assert!(error.message.contains("503"));

        assert!(rec.rearm());
        assert_eq!(rec.state(), BatchState::Running);
        assert_eq!(rec.retry_count, 0);
        assert_eq!(rec.polls, 0);
        assert!(rec.batch.error.is_none());
        assert!(!rec.rearm());
    }

    #[test]
    fn test_fail_keeps_last_remote_state() {
        let mut rec = record(BatchState::Running);
        rec.fail(&BarrageError::Permanent {
            batch_id: BatchId::from("batch_1"),
            message: "not found".to_string(),
        })
        .unwrap();
        assert_eq!(rec.state(), BatchState::Failed);
        assert_eq!(rec.last_remote_state, BatchState::Running);
        assert!(rec.batch.error.as_ref().unwrap().message.contains("not found"));
        assert!(!rec.rearm());
    }
}
