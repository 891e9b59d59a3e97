//! Batch lifecycle manager.
//!
//! The manager owns every state transition of a batch. It submits a request set through a
//! provider adapter, drives each resulting batch to a terminal state by polling with
//! backoff, fetches the results of completed batches, and hands everything to the
//! reconciler. Every transition is persisted through the lifecycle store before the next
//! network call, so a run can be resumed from disk after a restart.
//!
//! Batches are polled independently through a bounded pool: a semaphore limits how many
//! polls are on the wire at once, while waiting between polls holds no permit.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::StreamExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::batch::{
    Batch, BatchId, BatchState, LifecycleRecord, Outcome, OutcomeSummary, RawOutcome, RunId,
};
use crate::error::{BarrageError, Result};
use crate::provider::{ProviderAdapter, submit_chunks};
use crate::reconcile::reconcile;
use crate::request::RequestSet;
use crate::store::LifecycleStore;

pub mod backoff;
pub mod transitions;

pub use backoff::BackoffPolicy;

/// Configuration of the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub backoff: BackoffPolicy,
    /// Maximum number of polls on the wire at once
    pub poll_concurrency: usize,
    /// Maximum number of chunks being submitted at once
    pub submit_concurrency: usize,
    /// Attempts at fetching the results of one completed batch
    pub fetch_attempts: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            poll_concurrency: 8,
            submit_concurrency: 4,
            fetch_attempts: 5,
        }
    }
}

/// Result of submitting one request set.
#[derive(Debug, Clone)]
pub struct SubmissionReport {
    pub run_id: RunId,
    /// One batch per chunk, ordered by chunk index
    pub batches: Vec<Batch>,
}

impl SubmissionReport {
    pub fn accepted(&self) -> impl Iterator<Item = &Batch> {
        self.batches
            .iter()
            .filter(|b| b.state != BatchState::Rejected)
    }

    pub fn rejected(&self) -> impl Iterator<Item = &Batch> {
        self.batches
            .iter()
            .filter(|b| b.state == BatchState::Rejected)
    }

    pub fn has_rejections(&self) -> bool {
        self.rejected().next().is_some()
    }
}

/// Result of a full cycle (or a resumed one).
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    /// Final lifecycle records, ordered by chunk index
    pub records: Vec<LifecycleRecord>,
    /// One outcome per request, in input order
    pub outcomes: Vec<Outcome>,
}

impl RunReport {
    pub fn summary(&self) -> OutcomeSummary {
        OutcomeSummary::from_outcomes(&self.outcomes)
    }

    pub fn has_rejections(&self) -> bool {
        self.records
            .iter()
            .any(|r| r.state() == BatchState::Rejected)
    }
}

/// Drives lifecycle records of one provider to terminal states.
pub struct LifecycleManager<A, S> {
    adapter: Arc<A>,
    store: Arc<S>,
    config: ManagerConfig,
    shutdown: CancellationToken,
    polls_in_flight: Arc<AtomicUsize>,
}

impl<A, S> LifecycleManager<A, S>
where
    A: ProviderAdapter + 'static,
    S: LifecycleStore + 'static,
{
    pub fn new(adapter: Arc<A>, store: Arc<S>, config: ManagerConfig) -> Self {
        Self {
            adapter,
            store,
            config,
            shutdown: CancellationToken::new(),
            polls_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Use an externally owned shutdown token (e.g. one cancelled on Ctrl-C).
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Number of polls currently on the wire.
    pub fn polls_in_flight(&self) -> usize {
        self.polls_in_flight.load(Ordering::Relaxed)
    }

    fn poller(&self) -> Poller<A, S> {
        Poller {
            adapter: self.adapter.clone(),
            store: self.store.clone(),
            policy: self.config.backoff.clone(),
            shutdown: self.shutdown.clone(),
            permits: Arc::new(Semaphore::new(self.config.poll_concurrency.max(1))),
            in_flight: self.polls_in_flight.clone(),
        }
    }

    /// Partition and submit a request set, persisting each batch as its chunk resolves.
    ///
    /// Rejected chunks are persisted too, in the `Rejected` state. A batch the store fails
    /// to record does not stop the others; the ids of every such batch are returned in
    /// `Unrecorded`. An authentication failure stops further submissions and is returned
    /// after the batches already accepted have been persisted.
    #[tracing::instrument(skip(self, requests), fields(provider = %self.adapter.provider(), requests = requests.len()))]
    pub async fn submit(&self, requests: &RequestSet) -> Result<SubmissionReport> {
        if requests.is_empty() {
            return Err(BarrageError::Validation("request set is empty".to_string()));
        }
        let run_id = RunId::new();
        let chunks = self.adapter.chunks(requests);
        tracing::info!(run_id = %run_id, chunks = chunks.len(), "Submitting request set");

        let mut resolved = pin!(submit_chunks(
            self.adapter.as_ref(),
            run_id,
            &chunks,
            self.config.submit_concurrency,
        ));
        let mut batches = Vec::with_capacity(chunks.len());
        let mut unrecorded = Vec::new();
        let mut store_error = None;
        let mut auth_error = None;

        while let Some(result) = resolved.next().await {
            match result {
                Ok(Some(batch)) => {
                    let record = LifecycleRecord::new(batch.clone());
                    if let Err(e) = self.store.persist(&record).await {
                        tracing::error!(batch_id = %batch.batch_id, error = %e, "Submitted batch could not be recorded");
                        unrecorded.push(batch.batch_id.clone());
                        store_error.get_or_insert(e);
                    }
                    batches.push(batch);
                }
                Ok(None) => {}
                Err(e) => {
                    auth_error.get_or_insert(e);
                }
            }
        }

        if let Some(source) = store_error {
            if let Some(e) = &auth_error {
                tracing::error!(run_id = %run_id, error = %e, "Submission also stopped by authentication failure");
            }
            return Err(BarrageError::Unrecorded {
                batch_ids: unrecorded,
                source: Box::new(source),
            });
        }
        if let Some(e) = auth_error {
            tracing::error!(run_id = %run_id, recorded = batches.len(), "Submission stopped by authentication failure");
            return Err(e);
        }

        batches.sort_by_key(|batch| batch.chunk_index);
        let report = SubmissionReport { run_id, batches };
        tracing::info!(
            run_id = %run_id,
            accepted = report.accepted().count(),
            rejected = report.rejected().count(),
            "Request set submitted"
        );
        Ok(report)
    }

    /// Poll one non-terminal record once and persist the outcome.
    ///
    /// A transient failure spends one unit of the retry budget.
    pub async fn poll_once(&self, mut record: LifecycleRecord) -> Result<LifecycleRecord> {
        if !record.batch.is_terminal() {
            self.poller().step(&mut record, Budget::Spend).await?;
        }
        Ok(record)
    }

    /// Observe the remote state of a record once without touching its retry budget.
    pub async fn refresh(&self, mut record: LifecycleRecord) -> Result<LifecycleRecord> {
        if !record.batch.is_terminal() {
            self.poller().step(&mut record, Budget::Keep).await?;
        }
        Ok(record)
    }

    /// Drive one stored batch to a terminal state.
    pub async fn poll_batch(&self, batch_id: &BatchId) -> Result<LifecycleRecord> {
        let record = self.store.get(batch_id).await?;
        self.poller().drive(record).await
    }

    /// Drive stored batches to terminal states.
    pub async fn poll_all(&self, batch_ids: &[BatchId]) -> Result<Vec<LifecycleRecord>> {
        let mut records = Vec::with_capacity(batch_ids.len());
        for batch_id in batch_ids {
            records.push(self.store.get(batch_id).await?);
        }
        self.poll_records(records).await
    }

    /// Drive records to terminal states concurrently.
    ///
    /// Returns the records ordered by chunk index. Records still pending when shutdown is
    /// requested are returned in their last persisted state.
    pub async fn poll_records(&self, records: Vec<LifecycleRecord>) -> Result<Vec<LifecycleRecord>> {
        let poller = self.poller();
        let mut done = Vec::with_capacity(records.len());
        let mut join_set = JoinSet::new();

        for record in records {
            if record.batch.is_terminal() {
                done.push(record);
                continue;
            }
            let poller = poller.clone();
            join_set.spawn(async move { poller.drive(record).await });
        }

        tracing::debug!(active = join_set.len(), "Polling batches");

        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(record)) => done.push(record),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Polling task failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Polling task panicked");
                    first_error.get_or_insert(BarrageError::Other(anyhow::anyhow!(
                        "polling task panicked: {e}"
                    )));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        done.sort_by_key(|r| r.batch.chunk_index);
        Ok(done)
    }

    /// Fetch the results of every completed record.
    ///
    /// Transient failures are retried up to `fetch_attempts` times. A batch whose results
    /// cannot be fetched gets the error attached to its record (and persisted) and is
    /// left out of the returned map.
    pub async fn fetch_results(
        &self,
        records: &mut [LifecycleRecord],
    ) -> Result<HashMap<BatchId, Vec<RawOutcome>>> {
        let policy = &self.config.backoff;
        let attempts = self.config.fetch_attempts.max(1);
        let mut results = HashMap::new();

        for record in records
            .iter_mut()
            .filter(|r| r.state() == BatchState::Completed)
        {
            let batch_id = record.batch.batch_id.clone();
            let mut attempt = 0;
            let fetched = loop {
                attempt += 1;
                match self.adapter.fetch_results(&record.batch).await {
                    Ok(outcomes) => break Ok(outcomes),
                    Err(e) if e.is_retryable() && attempt < attempts => {
                        tracing::warn!(batch_id = %batch_id, attempt, error = %e, "Fetching results failed, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(policy.delay(attempt - 1)) => {}
                            _ = self.shutdown.cancelled() => break Err(BarrageError::Shutdown),
                        }
                    }
                    Err(e) => break Err(e),
                }
            };

            match fetched {
                Ok(outcomes) => {
                    if record.batch.error.take().is_some() {
                        self.store.persist(record).await?;
                    }
                    results.insert(batch_id, outcomes);
                }
                Err(BarrageError::Shutdown) => return Err(BarrageError::Shutdown),
                Err(e) => {
                    tracing::error!(batch_id = %batch_id, error = %e, "Results could not be fetched");
                    record.attach_error(&e);
                    self.store.persist(record).await?;
                }
            }
        }
        Ok(results)
    }

    /// Submit, poll, fetch and reconcile a request set.
    pub async fn run(&self, requests: &RequestSet) -> Result<RunReport> {
        let report = self.submit(requests).await?;
        let records = report
            .batches
            .into_iter()
            .map(LifecycleRecord::new)
            .collect();
        self.complete(report.run_id, requests, records).await
    }

    /// Continue a run from its persisted records without re-submitting anything.
    ///
    /// Batches parked in `PollTimeout` are re-armed first.
    #[tracing::instrument(skip(self, requests), fields(run_id = %run_id))]
    pub async fn resume(&self, run_id: RunId, requests: &RequestSet) -> Result<RunReport> {
        let mut records = self.store.list_run(run_id).await?;
        if records.is_empty() {
            return Err(BarrageError::Validation(format!(
                "no batches recorded for run {}",
                run_id
            )));
        }
        for record in records.iter_mut() {
            if record.batch.provider != self.adapter.provider() {
                return Err(BarrageError::Validation(format!(
                    "run {} was submitted to {}, not {}",
                    run_id,
                    record.batch.provider,
                    self.adapter.provider()
                )));
            }
            if record.rearm() {
                self.store.persist(record).await?;
            }
        }
        tracing::info!(batches = records.len(), "Resuming run");
        self.complete(run_id, requests, records).await
    }

    async fn complete(
        &self,
        run_id: RunId,
        requests: &RequestSet,
        records: Vec<LifecycleRecord>,
    ) -> Result<RunReport> {
        let mut records = self.poll_records(records).await?;

        if records.iter().any(|r| !r.batch.is_terminal()) {
            // Only reachable when polling was interrupted
            tracing::info!(run_id = %run_id, "Run interrupted before all batches finished");
            return Err(BarrageError::Shutdown);
        }

        let raw = self.fetch_results(&mut records).await?;
        let batches: Vec<Batch> = records.iter().map(|r| r.batch.clone()).collect();
        let outcomes = reconcile(requests, &batches, &raw);

        let report = RunReport {
            run_id,
            records,
            outcomes,
        };
        let summary = report.summary();
        tracing::info!(
            run_id = %run_id,
            total = summary.total,
            succeeded = summary.succeeded,
            provider_errors = summary.provider_errors,
            missing = summary.missing,
            "Run reconciled"
        );
        Ok(report)
    }

    /// Lifecycle records of one run, or of every run.
    pub async fn status(&self, run_id: Option<RunId>) -> Result<Vec<LifecycleRecord>> {
        status(self.store.as_ref(), run_id).await
    }
}

/// Lifecycle records of one run (by chunk index), or of every run (oldest first).
pub async fn status<S: LifecycleStore + ?Sized>(
    store: &S,
    run_id: Option<RunId>,
) -> Result<Vec<LifecycleRecord>> {
    match run_id {
        Some(run_id) => store.list_run(run_id).await,
        None => {
            let mut records = store.list().await?;
            records.sort_by(|a, b| {
                (a.batch.submitted_at, a.batch.chunk_index)
                    .cmp(&(b.batch.submitted_at, b.batch.chunk_index))
            });
            Ok(records)
        }
    }
}

/// Whether a poll spends the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Budget {
    Spend,
    Keep,
}

/// Everything a polling task needs; cloned into each task.
struct Poller<A, S> {
    adapter: Arc<A>,
    store: Arc<S>,
    policy: BackoffPolicy,
    shutdown: CancellationToken,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
}

impl<A, S> Clone for Poller<A, S> {
    fn clone(&self) -> Self {
        Self {
            adapter: self.adapter.clone(),
            store: self.store.clone(),
            policy: self.policy.clone(),
            shutdown: self.shutdown.clone(),
            permits: self.permits.clone(),
            in_flight: self.in_flight.clone(),
        }
    }
}

impl<A: ProviderAdapter, S: LifecycleStore> Poller<A, S> {
    /// Poll until the record is terminal or shutdown is requested.
    ///
    /// A poll that has started always completes and persists its result.
    async fn drive(self, mut record: LifecycleRecord) -> Result<LifecycleRecord> {
        let batch_id = record.batch.batch_id.clone();
        tracing::debug!(batch_id = %batch_id, state = %record.state(), "Driving batch");

        loop {
            if record.batch.is_terminal() {
                break;
            }
            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => permit.map_err(|e| {
                    BarrageError::Other(anyhow::anyhow!("poll pool closed: {e}"))
                })?,
                _ = self.shutdown.cancelled() => break,
            };

            self.step(&mut record, Budget::Spend).await?;
            drop(permit);

            if record.batch.is_terminal() {
                break;
            }
            let delay = self.policy.delay(record.polls.saturating_sub(1));
            tracing::trace!(batch_id = %batch_id, delay_ms = delay.as_millis() as u64, "Sleeping before next poll");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => {
                    tracing::info!(batch_id = %batch_id, state = %record.state(), "Shutdown requested, stopping polls");
                    break;
                }
            }
        }
        Ok(record)
    }

    /// One poll: apply its result to the record and persist it.
    ///
    /// Only transient failures count toward the retry budget; a healthy poll of a running
    /// batch only advances the backoff.
    async fn step(&self, record: &mut LifecycleRecord, budget: Budget) -> Result<()> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::Relaxed);
        });

        counter!("barrage_polls_total", "provider" => record.batch.provider.as_str()).increment(1);
        let polled = self.adapter.poll(&record.batch).await;
        if budget == Budget::Spend {
            record.polls = record.polls.saturating_add(1);
        }

        match polled {
            Ok(state) => {
                tracing::debug!(
                    batch_id = %record.batch.batch_id,
                    observed = %state,
                    polls = record.polls,
                    "Poll succeeded"
                );
                if let Err(e) = record.observe(state) {
                    record.fail(&e)?;
                }
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    batch_id = %record.batch.batch_id,
                    retry_count = record.retry_count,
                    error = %e,
                    "Poll failed, will retry"
                );
                record.note_transient(&e);
                if budget == Budget::Spend {
                    record.record_attempt(&self.policy);
                }
            }
            Err(e) => {
                record.fail(&e)?;
            }
        }

        self.store.persist(record).await
    }
}
