//! Integration tests for the delivery pipeline.
//!
//! Each test runs a throwaway axum server as the subscriber endpoint and
//! drives events through ingestion, workers, retries and the ledger.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use serde_json::{json, Value};
use tokio_test::assert_ok;

use hookrelay_core::signature;
use hookrelay_core::{
    DeliveryAttempt, DeliveryJob, DeliveryLedger, DeliverySettings, DeliveryStatus,
    DeliveryWorker, Event, JobOutcome, NewAttempt, PairKey, RelayConfig, RelayError,
    RelayResult, RelayRuntime, RetryPolicy, Subscription,
};

const SECRET: &str = "mytestsecret123";

#[derive(Clone)]
struct Target {
    status: Arc<AtomicU16>,
    received: Arc<Mutex<Vec<(HeaderMap, Bytes)>>>,
}

impl Target {
    fn hits(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }
}

async fn receive(State(target): State<Target>, headers: HeaderMap, body: Bytes) -> StatusCode {
    target.received.lock().unwrap().push((headers, body));
    StatusCode::from_u16(target.status.load(Ordering::SeqCst)).unwrap()
}

/// Start a subscriber endpoint answering every request with `status`.
async fn spawn_target(status: u16) -> (String, Target) {
    let target = Target {
        status: Arc::new(AtomicU16::new(status)),
        received: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/hook", post(receive))
        .with_state(target.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/hook", addr), target)
}

fn test_config() -> RelayConfig {
    RelayConfig::in_memory()
        .with_max_tries(5)
        .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(10)))
        .with_worker_count(2)
        .without_recovery()
}

async fn subscribe(runtime: &RelayRuntime, url: &str) -> Subscription {
    runtime
        .registry()
        .create(Subscription::new(url, "order.created").with_secret(SECRET))
        .await
        .unwrap()
}

fn order_body() -> Value {
    json!({"event": "order.created", "data": {"order_id": 101, "amount": 299}})
}

async fn ingest(runtime: &RelayRuntime, subscription_id: &str, body: &Value) -> Event {
    let raw = serde_json::to_vec(body).unwrap();
    let sig = signature::sign(SECRET.as_bytes(), body);
    runtime
        .ingest()
        .ingest(subscription_id, &raw, Some(&sig))
        .await
        .unwrap()
}

/// Worker driven by hand, with a retry delay long enough that no timer fires
/// during the test.
fn manual_worker(runtime: &RelayRuntime, settings: DeliverySettings) -> DeliveryWorker {
    DeliveryWorker::new(
        runtime.registry(),
        runtime.events(),
        runtime.ledger(),
        runtime.retries(),
        settings,
    )
    .unwrap()
}

fn slow_retry_settings() -> DeliverySettings {
    DeliverySettings {
        max_tries: 5,
        retry_policy: RetryPolicy::fixed(Duration::from_secs(3600)),
        retry_client_errors: true,
        timeout: Duration::from_secs(5),
    }
}

async fn wait_for_terminal(ledger: &Arc<dyn DeliveryLedger>, event_id: &str) -> Vec<DeliveryAttempt> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let attempts = ledger.attempts_for_event(event_id).unwrap();
        if attempts.last().is_some_and(|a| a.status.is_terminal()) {
            return attempts;
        }
        assert!(
            Instant::now() < deadline,
            "pair never reached a terminal state: {:?}",
            attempts
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn attempt_numbers(attempts: &[DeliveryAttempt]) -> Vec<u32> {
    attempts.iter().map(|a| a.attempt_number).collect()
}

/// Target returns 200 on the first attempt: one success row.
#[tokio::test]
async fn test_successful_delivery_records_single_attempt() {
    let (url, target) = spawn_target(200).await;
    let runtime = RelayRuntime::new(test_config()).await.unwrap();
    runtime.start().await.unwrap();

    let sub = subscribe(&runtime, &url).await;
    let event = ingest(&runtime, &sub.id, &order_body()).await;

    let attempts = wait_for_terminal(&runtime.ledger(), &event.id).await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].attempt_number, 1);
    assert_eq!(attempts[0].status, DeliveryStatus::Success);
    assert_eq!(attempts[0].http_code, Some(200));
    assert_eq!(target.hits(), 1);

    runtime.shutdown().await.unwrap();
}

/// Outbound requests carry the canonical body and a verifiable signature.
#[tokio::test]
async fn test_delivery_request_shape() {
    let (url, target) = spawn_target(204).await;
    let runtime = RelayRuntime::new(test_config()).await.unwrap();
    runtime.start().await.unwrap();

    let sub = subscribe(&runtime, &url).await;
    let body = order_body();
    let event = ingest(&runtime, &sub.id, &body).await;
    wait_for_terminal(&runtime.ledger(), &event.id).await;

    let received = target.received.lock().unwrap();
    let (headers, raw) = &received[0];
    assert_eq!(raw.as_ref(), signature::canonicalize(&body).as_slice());
    assert_eq!(headers["content-type"], "application/json");
    assert_eq!(headers["x-hookrelay-event"], "order.created");
    assert_eq!(headers["x-hookrelay-delivery"], event.id.as_str());
    assert_eq!(headers["x-hookrelay-attempt"], "1");

    let sig = headers["x-hookrelay-signature"].to_str().unwrap();
    assert!(signature::verify(SECRET.as_bytes(), &body, sig));
    drop(received);

    runtime.shutdown().await.unwrap();
}

/// Target returns 500 forever: attempts 1..=6, five pending then failed.
#[tokio::test]
async fn test_persistent_failure_exhausts_budget() {
    let (url, target) = spawn_target(500).await;
    let runtime = RelayRuntime::new(test_config()).await.unwrap();
    runtime.start().await.unwrap();

    let sub = subscribe(&runtime, &url).await;
    let event = ingest(&runtime, &sub.id, &order_body()).await;

    let attempts = wait_for_terminal(&runtime.ledger(), &event.id).await;
    assert_eq!(attempt_numbers(&attempts), vec![1, 2, 3, 4, 5, 6]);
    for attempt in &attempts[..5] {
        assert_eq!(attempt.status, DeliveryStatus::Pending);
        assert_eq!(attempt.http_code, Some(500));
        assert!(attempt.error_details.as_deref().unwrap().contains("500"));
    }
    assert_eq!(attempts[5].status, DeliveryStatus::Failed);
    let terminal = attempts[5].error_details.as_deref().unwrap();
    assert!(terminal.starts_with("Attempt budget exhausted after 6 attempts"));
    assert!(terminal.contains("500"));

    // Nothing further is ever scheduled.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(runtime.retries().pending_count(), 0);
    assert_eq!(runtime.ledger().attempts_for_event(&event.id).unwrap().len(), 6);
    assert_eq!(target.hits(), 6);

    runtime.shutdown().await.unwrap();
}

/// A transient failure followed by recovery ends in success.
#[tokio::test]
async fn test_retry_then_success() {
    let (url, target) = spawn_target(503).await;
    let runtime = RelayRuntime::new(test_config()).await.unwrap();
    let worker = manual_worker(&runtime, slow_retry_settings());

    let sub = subscribe(&runtime, &url).await;
    let event = ingest(&runtime, &sub.id, &order_body()).await;
    let job = runtime.queue().dequeue().await.unwrap();

    let outcome = worker.process(&job).await.unwrap();
    assert!(matches!(outcome, JobOutcome::RetryScheduled(ref a) if a.attempt_number == 1));
    assert!(runtime.retries().is_scheduled(&job.pair()));

    target.set_status(200);
    runtime.retries().cancel(&job.pair());
    let outcome = worker.process(&job).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Delivered(ref a) if a.attempt_number == 2));

    let statuses: Vec<DeliveryStatus> = runtime
        .ledger()
        .attempts_for_event(&event.id)
        .unwrap()
        .into_iter()
        .map(|a| a.status)
        .collect();
    assert_eq!(statuses, vec![DeliveryStatus::Pending, DeliveryStatus::Success]);
}

/// The budget holds when jobs are processed directly, and extra jobs for a
/// concluded pair never reach the target.
#[tokio::test]
async fn test_no_attempt_after_budget() {
    let (url, target) = spawn_target(500).await;
    let runtime = RelayRuntime::new(test_config()).await.unwrap();
    let worker = manual_worker(&runtime, slow_retry_settings());

    let sub = subscribe(&runtime, &url).await;
    let event = ingest(&runtime, &sub.id, &order_body()).await;
    let job = DeliveryJob::new(&sub.id, &event.id);

    for n in 1..=5 {
        let outcome = worker.process(&job).await.unwrap();
        assert!(matches!(outcome, JobOutcome::RetryScheduled(ref a) if a.attempt_number == n));
    }
    let outcome = worker.process(&job).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Failed(ref a) if a.attempt_number == 6));

    assert_eq!(worker.process(&job).await.unwrap(), JobOutcome::Skipped);
    assert_eq!(target.hits(), 6);
}

/// Concurrent jobs for one pair still produce contiguous attempt numbers.
#[tokio::test]
async fn test_concurrent_jobs_keep_attempts_contiguous() {
    let (url, _target) = spawn_target(500).await;
    let runtime = RelayRuntime::new(test_config()).await.unwrap();
    let worker = Arc::new(manual_worker(&runtime, slow_retry_settings()));

    let sub = subscribe(&runtime, &url).await;
    let event = ingest(&runtime, &sub.id, &order_body()).await;
    let job = DeliveryJob::new(&sub.id, &event.id);

    let tasks = (0..4).map(|_| {
        let worker = worker.clone();
        let job = job.clone();
        tokio::spawn(async move { worker.process(&job).await })
    });
    for result in futures::future::join_all(tasks).await {
        assert!(result.unwrap().is_ok());
    }

    let attempts = runtime.ledger().attempts_for_event(&event.id).unwrap();
    assert_eq!(attempt_numbers(&attempts), vec![1, 2, 3, 4]);
}

/// Deleting a subscription cancels its pending retry; a stray job for it
/// fails with NotFound and writes nothing.
#[tokio::test]
async fn test_delete_between_retries_fails_closed() {
    let (url, target) = spawn_target(500).await;
    let runtime = RelayRuntime::new(test_config()).await.unwrap();
    let worker = manual_worker(&runtime, slow_retry_settings());

    let sub = subscribe(&runtime, &url).await;
    let event = ingest(&runtime, &sub.id, &order_body()).await;
    let job = DeliveryJob::new(&sub.id, &event.id);

    worker.process(&job).await.unwrap();
    worker.process(&job).await.unwrap();
    assert_eq!(runtime.retries().pending_count(), 1);

    runtime.registry().delete(&sub.id).await.unwrap();
    assert_eq!(runtime.retries().pending_count(), 0);

    let err = worker.process(&job).await.unwrap_err();
    assert!(matches!(err, RelayError::NotFound { .. }));

    // Audit rows survive the deletion.
    let attempts = runtime.ledger().attempts_for_event(&event.id).unwrap();
    assert_eq!(attempt_numbers(&attempts), vec![1, 2]);
    assert_eq!(target.hits(), 2);
}

/// With client-error retries disabled a 4xx concludes the pair at once.
#[tokio::test]
async fn test_client_error_without_retry() {
    let (url, _target) = spawn_target(410).await;
    let runtime = RelayRuntime::new(test_config()).await.unwrap();
    let worker = manual_worker(
        &runtime,
        DeliverySettings {
            retry_client_errors: false,
            ..slow_retry_settings()
        },
    );

    let sub = subscribe(&runtime, &url).await;
    let event = ingest(&runtime, &sub.id, &order_body()).await;

    let outcome = worker
        .process(&DeliveryJob::new(&sub.id, &event.id))
        .await
        .unwrap();
    let JobOutcome::Failed(attempt) = outcome else {
        panic!("expected terminal failure, got {:?}", outcome);
    };
    assert_eq!(attempt.attempt_number, 1);
    assert_eq!(attempt.http_code, Some(410));
    assert_eq!(runtime.retries().pending_count(), 0);
}

/// Connection failures are retried and carry no HTTP code.
#[tokio::test]
async fn test_unreachable_target_is_transient() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/hook", listener.local_addr().unwrap());
    drop(listener);

    let runtime = RelayRuntime::new(test_config()).await.unwrap();
    let worker = manual_worker(&runtime, slow_retry_settings());
    let sub = subscribe(&runtime, &url).await;
    let event = ingest(&runtime, &sub.id, &order_body()).await;

    let outcome = worker
        .process(&DeliveryJob::new(&sub.id, &event.id))
        .await
        .unwrap();
    let JobOutcome::RetryScheduled(attempt) = outcome else {
        panic!("expected retry, got {:?}", outcome);
    };
    assert_eq!(attempt.http_code, None);
    assert!(attempt.error_details.is_some());
}

/// Pending pairs from a previous run are retried on start.
#[tokio::test]
async fn test_startup_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("hookrelay.db");
    let (url, target) = spawn_target(500).await;

    let (sub, event) = {
        let runtime = RelayRuntime::new(test_config().with_database_path(&db))
            .await
            .unwrap();
        let worker = manual_worker(&runtime, slow_retry_settings());
        let sub = subscribe(&runtime, &url).await;
        let event = ingest(&runtime, &sub.id, &order_body()).await;
        worker
            .process(&DeliveryJob::new(&sub.id, &event.id))
            .await
            .unwrap();
        runtime.shutdown().await.unwrap();
        (sub, event)
    };

    target.set_status(200);
    let config = RelayConfig {
        recover_on_start: true,
        ..test_config().with_database_path(&db)
    };
    let runtime = RelayRuntime::new(config).await.unwrap();
    runtime.start().await.unwrap();

    let attempts = wait_for_terminal(&runtime.ledger(), &event.id).await;
    assert_eq!(attempt_numbers(&attempts), vec![1, 2]);
    assert_eq!(attempts[1].status, DeliveryStatus::Success);
    assert_eq!(attempts[1].subscription_id, sub.id);

    let pair = PairKey::new(&sub.id, &event.id);
    assert!(runtime.ledger().unfinished_pairs().unwrap().is_empty());
    assert_eq!(runtime.ledger().attempt_count(&pair).unwrap(), 2);

    runtime.shutdown().await.unwrap();
}

/// Jobs already queued at shutdown are still delivered.
#[tokio::test]
async fn test_shutdown_drains_queue() {
    let (url, target) = spawn_target(200).await;
    let runtime = RelayRuntime::new(test_config()).await.unwrap();

    let sub = subscribe(&runtime, &url).await;
    let first = ingest(&runtime, &sub.id, &order_body()).await;
    let second = ingest(&runtime, &sub.id, &order_body()).await;

    assert_ok!(runtime.start().await);
    assert_ok!(runtime.shutdown().await);

    for event in [first, second] {
        let attempts = runtime.ledger().attempts_for_event(&event.id).unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, DeliveryStatus::Success);
    }
    assert_eq!(target.hits(), 2);
}

/// Ledger whose reads fail while `broken` is set.
struct BrokenReadLedger {
    inner: Arc<dyn DeliveryLedger>,
    broken: AtomicBool,
}

impl BrokenReadLedger {
    fn check(&self) -> RelayResult<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(RelayError::database("database is locked"));
        }
        Ok(())
    }
}

impl DeliveryLedger for BrokenReadLedger {
    fn record_attempt(&self, attempt: NewAttempt) -> RelayResult<DeliveryAttempt> {
        self.inner.record_attempt(attempt)
    }

    fn recent_for_subscription(
        &self,
        subscription_id: &str,
        limit: usize,
    ) -> RelayResult<Vec<DeliveryAttempt>> {
        self.inner.recent_for_subscription(subscription_id, limit)
    }

    fn attempts_for_event(&self, event_id: &str) -> RelayResult<Vec<DeliveryAttempt>> {
        self.inner.attempts_for_event(event_id)
    }

    fn attempt_count(&self, pair: &PairKey) -> RelayResult<u32> {
        self.check()?;
        self.inner.attempt_count(pair)
    }

    fn last_attempt(&self, pair: &PairKey) -> RelayResult<Option<DeliveryAttempt>> {
        self.check()?;
        self.inner.last_attempt(pair)
    }

    fn unfinished_pairs(&self) -> RelayResult<Vec<DeliveryAttempt>> {
        self.inner.unfinished_pairs()
    }
}

/// A store read failing before the first attempt reschedules the job
/// instead of losing the accepted event.
#[tokio::test]
async fn test_store_read_failure_reschedules_job() {
    let (url, target) = spawn_target(200).await;
    let runtime = RelayRuntime::new(test_config()).await.unwrap();
    let ledger = Arc::new(BrokenReadLedger {
        inner: runtime.ledger(),
        broken: AtomicBool::new(true),
    });
    let worker = DeliveryWorker::new(
        runtime.registry(),
        runtime.events(),
        ledger.clone(),
        runtime.retries(),
        slow_retry_settings(),
    )
    .unwrap();

    let sub = subscribe(&runtime, &url).await;
    let event = ingest(&runtime, &sub.id, &order_body()).await;
    let job = DeliveryJob::new(&sub.id, &event.id);
    let pair = job.pair();

    let err = worker.process(&job).await.unwrap_err();
    assert!(matches!(err, RelayError::Database { .. }));
    assert!(runtime.retries().is_scheduled(&pair));
    assert!(runtime.ledger().attempts_for_event(&event.id).unwrap().is_empty());
    assert_eq!(target.hits(), 0);

    // Once the store recovers the rescheduled job delivers attempt 1.
    ledger.broken.store(false, Ordering::SeqCst);
    runtime.retries().cancel(&pair);
    let outcome = worker.process(&job).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Delivered(ref a) if a.attempt_number == 1));
    assert_eq!(target.hits(), 1);
}

/// A job for a deleted subscription is dropped, not rescheduled.
#[tokio::test]
async fn test_missing_subscription_is_not_rescheduled() {
    let runtime = RelayRuntime::new(test_config()).await.unwrap();
    let worker = manual_worker(&runtime, slow_retry_settings());
    let job = DeliveryJob::new("gone", "event");

    worker.handle(job.clone()).await;
    assert!(!runtime.retries().is_scheduled(&job.pair()));
    assert_eq!(runtime.retries().pending_count(), 0);
}
