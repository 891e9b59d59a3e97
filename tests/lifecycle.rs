use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use barrage::provider::anthropic::{AnthropicAdapter, AnthropicConfig};
use barrage::{
    BackoffPolicy, BarrageError, BatchId, BatchState, FileStore, HttpResponse, LifecycleManager,
    LifecycleRecord, LifecycleStore, ManagerConfig, MemoryStore, MockHttpClient, OutcomeStatus,
    Request, RequestSet,
};
use serde_json::json;

const CREATE: &str = "POST /v1/messages/batches";

fn adapter(mock: &MockHttpClient, max_requests: usize) -> Arc<AnthropicAdapter<MockHttpClient>> {
    let config = AnthropicConfig {
        base_url: "https://api.anthropic.test".to_string(),
        max_requests,
        ..Default::default()
    };
    Arc::new(AnthropicAdapter::new(mock.clone(), config, "ak-test"))
}

fn config(max_attempts: u32) -> ManagerConfig {
    ManagerConfig {
        backoff: BackoffPolicy::immediate(max_attempts),
        submit_concurrency: 1,
        fetch_attempts: 2,
        ..Default::default()
    }
}

fn requests(ids: &[&str]) -> RequestSet {
    RequestSet::new(
        ids.iter()
            .map(|id| {
                Request::new(
                    *id,
                    json!({
                        "model": "claude-3-5-haiku-latest",
                        "messages": [{"role": "user", "content": format!("question {id}")}]
                    }),
                )
            })
            .collect(),
    )
    .unwrap()
}

fn poll_key(batch_id: &str) -> String {
    format!("GET /v1/messages/batches/{batch_id}")
}

fn results_key(batch_id: &str) -> String {
    format!("GET /v1/messages/batches/{batch_id}/results")
}

/// Memory store whose first `failures` writes fail.
struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicUsize,
}

impl FlakyStore {
    fn new(failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl LifecycleStore for FlakyStore {
    async fn persist(&self, record: &LifecycleRecord) -> barrage::Result<()> {
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(BarrageError::Io(std::io::Error::other("disk full")));
        }
        self.inner.persist(record).await
    }

    async fn get(&self, batch_id: &BatchId) -> barrage::Result<LifecycleRecord> {
        self.inner.get(batch_id).await
    }

    async fn list(&self) -> barrage::Result<Vec<LifecycleRecord>> {
        self.inner.list().await
    }
}

/// JSONL results where every position succeeded.
fn succeeded(positions: usize) -> HttpResponse {
    HttpResponse {
        status: 200,
        body: (0..positions)
            .map(|n| {
                json!({
                    "custom_id": format!("req-{n}"),
                    "result": {"type": "succeeded", "message": {"content": [{"type": "text", "text": format!("answer {n}")}]}}
                })
                .to_string()
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

#[test_log::test(tokio::test)]
async fn test_full_cycle_reconciles_every_request() {
    let mock = MockHttpClient::new();
    mock.add_json(CREATE, 200, json!({"id": "msgbatch_1", "processing_status": "in_progress"}));
    mock.add_json(&poll_key("msgbatch_1"), 200, json!({"processing_status": "in_progress"}));
    mock.add_json(&poll_key("msgbatch_1"), 200, json!({"processing_status": "ended"}));
    mock.add_response(
        &results_key("msgbatch_1"),
        Ok(HttpResponse {
            status: 200,
            body: [
                r#"{"custom_id":"req-0","result":{"type":"succeeded","message":{"content":[{"type":"text","text":"A"}]}}}"#,
                r#"{"custom_id":"req-1","result":{"type":"errored","error":{"type":"invalid_request_error","message":"too long"}}}"#,
            ]
            .join("\n"),
        }),
    );
    let store = Arc::new(MemoryStore::new());
    let manager = LifecycleManager::new(adapter(&mock, 100), store.clone(), config(10));

    let report = manager.run(&requests(&["a", "b", "c"])).await.unwrap();

    let outcomes = &report.outcomes;
    assert_eq!(outcomes.len(), 3);
    assert_eq!(&*outcomes[0].request_id, "a");
    assert_eq!(outcomes[0].status, OutcomeStatus::Success);
    assert_eq!(outcomes[1].status, OutcomeStatus::ProviderError);
    assert_eq!(outcomes[1].error.as_deref(), Some("too long"));
    assert_eq!(outcomes[2].status, OutcomeStatus::Missing);
    assert!(outcomes[2].error.as_ref().unwrap().contains("absent from provider results"));

    let summary = report.summary();
    assert_eq!((summary.succeeded, summary.provider_errors, summary.missing), (1, 1, 1));
    assert!(!report.has_rejections());

    let batch_id = BatchId::from("msgbatch_1");
    assert_eq!(
        store.states_of(&batch_id),
        vec![BatchState::Submitted, BatchState::Running, BatchState::Completed]
    );
    assert_eq!(mock.pending_responses(), 0);
}

#[test_log::test(tokio::test)]
async fn test_permanent_poll_error_fails_batch_without_more_polls() {
    let mock = MockHttpClient::new();
    mock.add_json(CREATE, 200, json!({"id": "msgbatch_gone"}));
    mock.add_json(&poll_key("msgbatch_gone"), 404, json!({"error": {"type": "not_found_error"}}));
    let store = Arc::new(MemoryStore::new());
    let manager = LifecycleManager::new(adapter(&mock, 100), store.clone(), config(10));

    let report = manager.run(&requests(&["a", "b"])).await.unwrap();

    assert_eq!(report.records[0].state(), BatchState::Failed);
    assert_eq!(mock.calls_to(&poll_key("msgbatch_gone")).len(), 1);
    assert!(mock.calls_to(&results_key("msgbatch_gone")).is_empty());
    for outcome in &report.outcomes {
        assert_eq!(outcome.status, OutcomeStatus::Missing);
        let reason = outcome.error.as_deref().unwrap();
        assert!(reason.contains("failed"), "{reason}");
        assert!(reason.contains("batch not found"), "{reason}");
    }

    let stored = store.get(&BatchId::from("msgbatch_gone")).await.unwrap();
    assert_eq!(stored.state(), BatchState::Failed);
}

#[test_log::test(tokio::test)]
async fn test_transient_errors_exhaust_budget_into_poll_timeout() {
    let mock = MockHttpClient::new();
    mock.add_json(CREATE, 200, json!({"id": "msgbatch_slow"}));
    for _ in 0..3 {
        mock.add_json(&poll_key("msgbatch_slow"), 503, json!({"error": "overloaded"}));
    }
    let store = Arc::new(MemoryStore::new());
    let manager = LifecycleManager::new(adapter(&mock, 100), store.clone(), config(3));

    let report = manager.run(&requests(&["a"])).await.unwrap();

    let record = &report.records[0];
    assert_eq!(record.state(), BatchState::PollTimeout);
    assert_eq!(record.retry_count, 3);
    assert_eq!(record.last_remote_state, BatchState::Submitted);
    let message = &record.batch.error.as_ref().unwrap().message;
    assert!(message.contains("retry budget exhausted after 3 failed polls"), "{message}");
    assert!(message.contains("503"), "{message}");

    assert_eq!(mock.calls_to(&poll_key("msgbatch_slow")).len(), 3);
    assert_eq!(report.outcomes[0].status, OutcomeStatus::Missing);
    assert!(report.outcomes[0].error.as_ref().unwrap().contains("poll_timeout"));
}

#[test_log::test(tokio::test)]
async fn test_healthy_polls_do_not_spend_retry_budget() {
    let mock = MockHttpClient::new();
    mock.add_json(CREATE, 200, json!({"id": "msgbatch_long"}));
    for _ in 0..5 {
        mock.add_json(&poll_key("msgbatch_long"), 200, json!({"processing_status": "in_progress"}));
    }
    mock.add_json(&poll_key("msgbatch_long"), 503, json!({"error": "overloaded"}));
    mock.add_json(&poll_key("msgbatch_long"), 200, json!({"processing_status": "ended"}));
    mock.add_response(&results_key("msgbatch_long"), Ok(succeeded(1)));
    let store = Arc::new(MemoryStore::new());
    let manager = LifecycleManager::new(adapter(&mock, 100), store.clone(), config(2));

    let report = manager.run(&requests(&["a"])).await.unwrap();

    let record = &report.records[0];
    assert_eq!(record.state(), BatchState::Completed);
    assert_eq!(record.polls, 7);
    assert_eq!(record.retry_count, 1);
    assert!(report.summary().is_complete());
}

#[test_log::test(tokio::test)]
async fn test_authentication_failure_stops_submission_and_keeps_accepted_batches() {
    let mock = MockHttpClient::new();
    mock.add_json(CREATE, 200, json!({"id": "msgbatch_first"}));
    mock.add_json(CREATE, 401, json!({"error": {"message": "invalid x-api-key"}}));
    mock.add_json(CREATE, 401, json!({"error": {"message": "invalid x-api-key"}}));
    let store = Arc::new(MemoryStore::new());
    let manager = LifecycleManager::new(adapter(&mock, 1), store.clone(), config(10));

    let result = manager.submit(&requests(&["a", "b", "c"])).await;

    assert!(matches!(result, Err(BarrageError::Authentication(_))));
    assert_eq!(mock.calls_to(CREATE).len(), 2);
    let recorded = store.list().await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].batch.batch_id, BatchId::from("msgbatch_first"));
    assert_eq!(recorded[0].state(), BatchState::Submitted);
}

#[test_log::test(tokio::test)]
async fn test_store_failure_still_records_other_batches() {
    let mock = MockHttpClient::new();
    for id in ["msgbatch_0", "msgbatch_1", "msgbatch_2"] {
        mock.add_json(CREATE, 200, json!({"id": id}));
    }
    let store = Arc::new(FlakyStore::new(1));
    let manager = LifecycleManager::new(adapter(&mock, 1), store.clone(), config(10));

    let result = manager.submit(&requests(&["a", "b", "c"])).await;

    match result {
        Err(BarrageError::Unrecorded { batch_ids, source }) => {
            assert_eq!(batch_ids, vec![BatchId::from("msgbatch_0")]);
            assert!(matches!(*source, BarrageError::Io(_)));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(mock.calls_to(CREATE).len(), 3);
    let mut recorded: Vec<BatchId> = store
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.batch.batch_id)
        .collect();
    recorded.sort();
    assert_eq!(recorded, vec![BatchId::from("msgbatch_1"), BatchId::from("msgbatch_2")]);
}

#[test_log::test(tokio::test)]
async fn test_poll_batch_drives_stored_record_to_completion() {
    let mock = MockHttpClient::new();
    mock.add_json(CREATE, 200, json!({"id": "msgbatch_one"}));
    mock.add_json(&poll_key("msgbatch_one"), 200, json!({"processing_status": "in_progress"}));
    mock.add_json(&poll_key("msgbatch_one"), 200, json!({"processing_status": "ended"}));
    let store = Arc::new(MemoryStore::new());
    let manager = LifecycleManager::new(adapter(&mock, 100), store.clone(), config(10));
    manager.submit(&requests(&["a"])).await.unwrap();
    let batch_id = BatchId::from("msgbatch_one");
    assert_eq!(store.get(&batch_id).await.unwrap().state(), BatchState::Submitted);

    let record = manager.poll_batch(&batch_id).await.unwrap();

    assert_eq!(record.state(), BatchState::Completed);
    assert_eq!(store.get(&batch_id).await.unwrap().state(), BatchState::Completed);
    assert_eq!(
        store.states_of(&batch_id),
        vec![BatchState::Submitted, BatchState::Running, BatchState::Completed]
    );
    assert!(mock.calls_to(&results_key("msgbatch_one")).is_empty());
}

#[test_log::test(tokio::test)]
async fn test_poll_all_returns_terminal_records_in_chunk_order() {
    let mock = MockHttpClient::new();
    let ids = ["msgbatch_c0", "msgbatch_c1", "msgbatch_c2"];
    for id in ids {
        mock.add_json(CREATE, 200, json!({"id": id}));
    }
    mock.add_json(&poll_key("msgbatch_c0"), 200, json!({"processing_status": "ended"}));
    mock.add_json(&poll_key("msgbatch_c1"), 404, json!({"error": {"type": "not_found_error"}}));
    mock.add_json(&poll_key("msgbatch_c2"), 200, json!({"processing_status": "in_progress"}));
    mock.add_json(&poll_key("msgbatch_c2"), 200, json!({"processing_status": "ended"}));
    let store = Arc::new(MemoryStore::new());
    let manager = LifecycleManager::new(adapter(&mock, 1), store, config(10));
    manager.submit(&requests(&["a", "b", "c"])).await.unwrap();

    let unknown = manager
        .poll_all(&[BatchId::from("msgbatch_c0"), BatchId::from("msgbatch_nope")])
        .await;
    assert!(matches!(unknown, Err(BarrageError::BatchNotFound(id)) if id == BatchId::from("msgbatch_nope")));
    assert!(mock.calls_to(&poll_key("msgbatch_c0")).is_empty());

    let reversed: Vec<BatchId> = ids.iter().rev().map(|id| BatchId::from(*id)).collect();
    let records = manager.poll_all(&reversed).await.unwrap();

    let order: Vec<(usize, BatchState)> = records
        .iter()
        .map(|r| (r.batch.chunk_index, r.state()))
        .collect();
    assert_eq!(
        order,
        vec![
            (0, BatchState::Completed),
            (1, BatchState::Failed),
            (2, BatchState::Completed)
        ]
    );
    assert!(records.iter().all(|r| r.batch.is_terminal()));
}

#[test_log::test(tokio::test)]
async fn test_refresh_observes_without_spending_retry_budget() {
    let mock = MockHttpClient::new();
    mock.add_json(CREATE, 200, json!({"id": "msgbatch_view"}));
    mock.add_json(&poll_key("msgbatch_view"), 200, json!({"processing_status": "in_progress"}));
    mock.add_json(&poll_key("msgbatch_view"), 503, json!({"error": "overloaded"}));
    mock.add_json(&poll_key("msgbatch_view"), 503, json!({"error": "overloaded"}));
    let store = Arc::new(MemoryStore::new());
    let manager = LifecycleManager::new(adapter(&mock, 100), store.clone(), config(1));
    manager.submit(&requests(&["a"])).await.unwrap();
    let batch_id = BatchId::from("msgbatch_view");

    let mut record = store.get(&batch_id).await.unwrap();
    for _ in 0..3 {
        record = manager.refresh(record).await.unwrap();
    }

    assert_eq!(record.state(), BatchState::Running);
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.polls, 0);
    assert!(record.last_error.as_ref().unwrap().message.contains("503"));
    let stored = store.get(&batch_id).await.unwrap();
    assert_eq!(stored.state(), BatchState::Running);
    assert_eq!(mock.calls_to(&poll_key("msgbatch_view")).len(), 3);
}

#[test_log::test(tokio::test)]
async fn test_rejected_chunk_does_not_block_other_chunks() {
    let mock = MockHttpClient::new();
    mock.add_json(CREATE, 200, json!({"id": "msgbatch_ok"}));
    mock.add_json(CREATE, 400, json!({"error": {"message": "requests too large"}}));
    mock.add_json(&poll_key("msgbatch_ok"), 200, json!({"processing_status": "ended"}));
    mock.add_response(&results_key("msgbatch_ok"), Ok(succeeded(2)));
    let store = Arc::new(MemoryStore::new());
    let manager = LifecycleManager::new(adapter(&mock, 2), store.clone(), config(10));

    let report = manager.run(&requests(&["a", "b", "c", "d"])).await.unwrap();

    assert_eq!(report.records.len(), 2);
    assert_eq!(report.records[0].state(), BatchState::Completed);
    assert_eq!(report.records[1].state(), BatchState::Rejected);
    assert!(report.has_rejections());

    let statuses: Vec<OutcomeStatus> = report.outcomes.iter().map(|o| o.status).collect();
    assert_eq!(
        statuses,
        vec![
            OutcomeStatus::Success,
            OutcomeStatus::Success,
            OutcomeStatus::Missing,
            OutcomeStatus::Missing
        ]
    );
    let reason = report.outcomes[3].error.as_deref().unwrap();
    assert!(reason.starts_with("submission rejected"), "{reason}");
    assert!(reason.contains("HTTP 400"), "{reason}");

    // The rejected chunk is recorded but never polled
    let rejected_id = report.records[1].batch.batch_id.clone();
    assert!(rejected_id.starts_with("rejected-"));
    assert!(store.get(&rejected_id).await.is_ok());
    assert_eq!(mock.calls_to(CREATE).len(), 2);
}

#[test_log::test(tokio::test)]
async fn test_resume_after_restart_never_resubmits() {
    let dir = tempfile::tempdir().unwrap();

    let run_id = {
        let mock = MockHttpClient::new();
        mock.add_json(CREATE, 200, json!({"id": "msgbatch_r"}));
        mock.add_json(&poll_key("msgbatch_r"), 200, json!({"processing_status": "in_progress"}));
        let store = Arc::new(FileStore::in_dir(dir.path()).await.unwrap());
        let manager = LifecycleManager::new(adapter(&mock, 100), store.clone(), config(10));

        let submitted = manager.submit(&requests(&["a", "b"])).await.unwrap();
        let record = store.get(&BatchId::from("msgbatch_r")).await.unwrap();
        let record = manager.poll_once(record).await.unwrap();
        assert_eq!(record.state(), BatchState::Running);
        submitted.run_id
    };

    // A fresh process: new client, store reopened from disk
    let mock = MockHttpClient::new();
    mock.add_json(&poll_key("msgbatch_r"), 200, json!({"processing_status": "ended"}));
    mock.add_response(&results_key("msgbatch_r"), Ok(succeeded(2)));
    let store = Arc::new(FileStore::in_dir(dir.path()).await.unwrap());
    let manager = LifecycleManager::new(adapter(&mock, 100), store.clone(), config(10));

    let records = manager.status(Some(run_id)).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state(), BatchState::Running);
    assert_eq!(records[0].polls, 1);
    assert_eq!(records[0].retry_count, 0);

    let report = manager.resume(run_id, &requests(&["a", "b"])).await.unwrap();

    assert!(mock.calls_to(CREATE).is_empty());
    assert!(report.summary().is_complete());
    assert_eq!(report.run_id, run_id);
    let stored = store.get(&BatchId::from("msgbatch_r")).await.unwrap();
    assert_eq!(stored.state(), BatchState::Completed);
}

#[test_log::test(tokio::test)]
async fn test_resume_rearms_poll_timeout() {
    let mock = MockHttpClient::new();
    mock.add_json(CREATE, 200, json!({"id": "msgbatch_t"}));
    mock.add_json(&poll_key("msgbatch_t"), 200, json!({"processing_status": "in_progress"}));
    mock.add_json(&poll_key("msgbatch_t"), 503, json!({"error": "overloaded"}));
    mock.add_json(&poll_key("msgbatch_t"), 503, json!({"error": "overloaded"}));
    let store = Arc::new(MemoryStore::new());
    let manager = LifecycleManager::new(adapter(&mock, 100), store.clone(), config(2));

    let first = manager.run(&requests(&["a"])).await.unwrap();
    assert_eq!(first.records[0].state(), BatchState::PollTimeout);
    assert_eq!(first.outcomes[0].status, OutcomeStatus::Missing);

    mock.add_json(&poll_key("msgbatch_t"), 200, json!({"processing_status": "ended"}));
    mock.add_response(&results_key("msgbatch_t"), Ok(succeeded(1)));

    let second = manager.resume(first.run_id, &requests(&["a"])).await.unwrap();

    assert_eq!(second.records[0].state(), BatchState::Completed);
    assert_eq!(second.outcomes[0].status, OutcomeStatus::Success);
    assert_eq!(mock.calls_to(CREATE).len(), 1);
    assert_eq!(
        store.states_of(&BatchId::from("msgbatch_t")),
        vec![
            BatchState::Submitted,
            BatchState::Running,
            BatchState::Running,
            BatchState::PollTimeout,
            BatchState::Running,
            BatchState::Completed
        ]
    );
}

#[test_log::test(tokio::test)]
async fn test_resume_of_unknown_run_fails() {
    let mock = MockHttpClient::new();
    let store = Arc::new(MemoryStore::new());
    let manager = LifecycleManager::new(adapter(&mock, 100), store, config(2));

    let result = manager
        .resume(barrage::RunId::new(), &requests(&["a"]))
        .await;
    assert!(matches!(result, Err(BarrageError::Validation(_))));
    assert_eq!(mock.call_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_empty_request_set_is_rejected_before_any_call() {
    let mock = MockHttpClient::new();
    let manager = LifecycleManager::new(adapter(&mock, 100), Arc::new(MemoryStore::new()), config(2));

    let result = manager.submit(&RequestSet::new(Vec::new()).unwrap()).await;

    assert!(matches!(result, Err(BarrageError::Validation(_))));
    assert_eq!(mock.call_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_fetch_retries_then_reports_unfetched_results() {
    let mock = MockHttpClient::new();
    mock.add_json(CREATE, 200, json!({"id": "msgbatch_f"}));
    mock.add_json(&poll_key("msgbatch_f"), 200, json!({"processing_status": "ended"}));
    mock.add_json(&results_key("msgbatch_f"), 502, json!({"error": "bad gateway"}));
    mock.add_json(&results_key("msgbatch_f"), 502, json!({"error": "bad gateway"}));
    let store = Arc::new(MemoryStore::new());
    let manager = LifecycleManager::new(adapter(&mock, 100), store.clone(), config(10));

    let report = manager.run(&requests(&["a"])).await.unwrap();

    assert_eq!(mock.calls_to(&results_key("msgbatch_f")).len(), 2);
    assert_eq!(report.records[0].state(), BatchState::Completed);
    let reason = report.outcomes[0].error.as_deref().unwrap();
    assert!(reason.contains("could not be fetched"), "{reason}");

    let stored = store.get(&BatchId::from("msgbatch_f")).await.unwrap();
    assert!(stored.batch.error.is_some());
}

#[test_log::test(tokio::test)]
async fn test_shutdown_lets_in_flight_poll_finish_and_persist() {
    let mock = MockHttpClient::new();
    mock.add_json(CREATE, 200, json!({"id": "msgbatch_s"}));
    let trigger = mock.add_response_with_trigger(
        &poll_key("msgbatch_s"),
        Ok(HttpResponse {
            status: 200,
            body: json!({"processing_status": "in_progress"}).to_string(),
        }),
    );
    let store = Arc::new(MemoryStore::new());
    let slow = ManagerConfig {
        backoff: BackoffPolicy {
            max_attempts: 100,
            backoff_ms: 60_000,
            backoff_factor: 1,
            max_backoff_ms: 60_000,
            jitter: false,
        },
        ..config(100)
    };
    let manager = LifecycleManager::new(adapter(&mock, 100), store.clone(), slow);

    let reqs = requests(&["a"]);
    let (result, ()) = tokio::join!(manager.run(&reqs), async {
        while manager.polls_in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        manager.shutdown_token().cancel();
        let _ = trigger.send(());
    });

    assert!(matches!(result, Err(BarrageError::Shutdown)));
    assert_eq!(manager.polls_in_flight(), 0);
    let stored = store.get(&BatchId::from("msgbatch_s")).await.unwrap();
    assert_eq!(stored.state(), BatchState::Running);
    assert_eq!(mock.calls_to(&poll_key("msgbatch_s")).len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_poll_pool_bounds_concurrent_polls() {
    let mock = MockHttpClient::new();
    let ids = ["msgbatch_p0", "msgbatch_p1", "msgbatch_p2"];
    let mut triggers = Vec::new();
    for id in ids {
        mock.add_json(CREATE, 200, json!({"id": id}));
        triggers.push(mock.add_response_with_trigger(
            &poll_key(id),
            Ok(HttpResponse {
                status: 200,
                body: json!({"processing_status": "ended"}).to_string(),
            }),
        ));
        mock.add_response(&results_key(id), Ok(succeeded(1)));
    }
    let bounded = ManagerConfig {
        poll_concurrency: 2,
        ..config(10)
    };
    let manager = LifecycleManager::new(adapter(&mock, 1), Arc::new(MemoryStore::new()), bounded);

    let reqs = requests(&["a", "b", "c"]);
    let (report, ()) = tokio::join!(manager.run(&reqs), async {
        while manager.polls_in_flight() < 2 {
            tokio::task::yield_now().await;
        }
        for _ in 0..50 {
            tokio::task::yield_now().await;
            assert!(manager.polls_in_flight() <= 2);
            assert!(mock.in_flight_count() <= 2);
        }
        for trigger in triggers.drain(..) {
            let _ = trigger.send(());
        }
    });

    let report = report.unwrap();
    assert_eq!(report.records.len(), 3);
    assert!(report.summary().is_complete());
}
