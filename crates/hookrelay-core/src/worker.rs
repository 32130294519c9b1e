//! Delivery worker and worker pool.
//!
//! A worker takes a job, delivers the event to the subscription target,
//! records the attempt in the ledger and either concludes the pair or
//! hands it to the retry scheduler. Errors never leave a worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{RelayError, RelayResult};
use crate::queue::DispatchQueue;
use crate::registry::SubscriptionRegistry;
use crate::retry::{RetryPolicy, RetryScheduler};
use crate::signature;
use crate::store::{DeliveryLedger, EventStore};
use crate::types::{
    DeliveryAttempt, DeliveryJob, DeliveryStatus, Event, NewAttempt, PairKey, Subscription,
};

/// Header naming the delivered event type.
pub const EVENT_HEADER: &str = "X-Hookrelay-Event";
/// Header carrying the event id.
pub const DELIVERY_HEADER: &str = "X-Hookrelay-Delivery";
/// Header carrying the 1-based attempt number.
pub const ATTEMPT_HEADER: &str = "X-Hookrelay-Attempt";
/// Header carrying the HMAC-SHA256 of the delivered body.
pub const SIGNATURE_HEADER: &str = "X-Hookrelay-Signature";

const MAX_ERROR_BODY: usize = 512;

type LockMap = HashMap<PairKey, Arc<Mutex<()>>>;

/// Per-pair mutual exclusion.
///
/// Entries are removed once no task holds or waits on them.
#[derive(Clone, Default)]
pub struct PairLocks {
    locks: Arc<StdMutex<LockMap>>,
}

impl PairLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a pair.
    pub async fn acquire(&self, pair: &PairKey) -> PairGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(pair.clone()).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;
        PairGuard {
            pair: pair.clone(),
            lock,
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Number of pairs currently tracked.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one pair; released on drop.
pub struct PairGuard {
    pair: PairKey,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<StdMutex<LockMap>>,
}

impl Drop for PairGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one here: nobody else is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.pair);
        }
    }
}

/// Knobs that shape delivery and retry decisions.
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    /// Retries allowed after the first attempt.
    pub max_tries: u32,
    pub retry_policy: RetryPolicy,
    /// Retry 4xx responses like any other failure.
    pub retry_client_errors: bool,
    pub timeout: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_tries: 5,
            retry_policy: RetryPolicy::default(),
            retry_client_errors: true,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Result of processing one job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Target answered 2xx.
    Delivered(DeliveryAttempt),
    /// Attempt failed, a retry was scheduled.
    RetryScheduled(DeliveryAttempt),
    /// Attempt failed and the pair is concluded.
    Failed(DeliveryAttempt),
    /// Pair already concluded; no request was made.
    Skipped,
}

/// Delivers jobs taken from the dispatch queue.
pub struct DeliveryWorker {
    registry: Arc<SubscriptionRegistry>,
    events: Arc<dyn EventStore>,
    ledger: Arc<dyn DeliveryLedger>,
    retries: Arc<RetryScheduler>,
    client: Client,
    locks: PairLocks,
    settings: DeliverySettings,
}

impl DeliveryWorker {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        events: Arc<dyn EventStore>,
        ledger: Arc<dyn DeliveryLedger>,
        retries: Arc<RetryScheduler>,
        settings: DeliverySettings,
    ) -> RelayResult<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| RelayError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            registry,
            events,
            ledger,
            retries,
            client,
            locks: PairLocks::new(),
            settings,
        })
    }

    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }

    /// Process a job, logging instead of returning errors.
    pub async fn handle(&self, job: DeliveryJob) {
        match self.process(&job).await {
            Ok(JobOutcome::Skipped) => {
                debug!(
                    subscription_id = %job.subscription_id,
                    event_id = %job.event_id,
                    "Skipped job for concluded pair"
                );
            }
            Ok(_) => {}
            Err(RelayError::NotFound { message, .. }) => {
                warn!(
                    subscription_id = %job.subscription_id,
                    event_id = %job.event_id,
                    "Dropping job: {}", message
                );
            }
            Err(e) => {
                error!(
                    subscription_id = %job.subscription_id,
                    event_id = %job.event_id,
                    error = %e,
                    "Delivery job failed"
                );
            }
        }
    }

    /// Process a single job.
    pub async fn process(&self, job: &DeliveryJob) -> RelayResult<JobOutcome> {
        let pair = job.pair();
        let _guard = self.locks.acquire(&pair).await;

        let subscription = self
            .registry
            .require(&job.subscription_id)
            .await
            .map_err(|e| self.requeue_on_store_error(job, 1, e))?;
        let event = self
            .events
            .get_event(&job.event_id)
            .map_err(|e| self.requeue_on_store_error(job, 1, e))?
            .ok_or_else(|| RelayError::event_not_found(&job.event_id))?;

        let last = self
            .ledger
            .last_attempt(&pair)
            .map_err(|e| self.requeue_on_store_error(job, 1, e))?;
        if let Some(last) = &last {
            if last.status.is_terminal() {
                return Ok(JobOutcome::Skipped);
            }
        }
        let attempt = self
            .ledger
            .attempt_count(&pair)
            .map_err(|e| {
                let next = last.as_ref().map_or(1, |l| l.attempt_number + 1);
                self.requeue_on_store_error(job, next, e)
            })?
            + 1;
        if attempt > self.settings.max_tries + 1 {
            return Ok(JobOutcome::Skipped);
        }

        let record = match self.send(&subscription, &event, attempt).await {
            Ok(code) => NewAttempt::success(pair.clone(), attempt, code),
            Err(e) => {
                let http_code = e.http_status();
                if !e.is_transient() {
                    NewAttempt::failure(pair.clone(), attempt, DeliveryStatus::Failed, http_code, e.to_string())
                } else if attempt <= self.settings.max_tries {
                    NewAttempt::failure(pair.clone(), attempt, DeliveryStatus::Pending, http_code, e.to_string())
                } else {
                    let exhausted = RelayError::BudgetExhausted { attempts: attempt };
                    NewAttempt::failure(
                        pair.clone(),
                        attempt,
                        DeliveryStatus::Failed,
                        http_code,
                        format!("{}: {}", exhausted, e),
                    )
                }
            }
        };

        let written = match self.ledger.record_attempt(record) {
            Ok(written) => written,
            Err(e) => return Err(self.requeue(job, attempt, e)),
        };

        let outcome = match written.status {
            DeliveryStatus::Success => {
                info!(
                    subscription_id = %pair.subscription_id,
                    event_id = %pair.event_id,
                    attempt,
                    http_code = written.http_code,
                    "Delivered"
                );
                JobOutcome::Delivered(written)
            }
            DeliveryStatus::Pending => {
                let delay = self.settings.retry_policy.delay(attempt);
                warn!(
                    subscription_id = %pair.subscription_id,
                    event_id = %pair.event_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = written.error_details.as_deref().unwrap_or_default(),
                    "Delivery failed, retry scheduled"
                );
                if !self.retries.schedule(job.clone(), delay) {
                    debug!(pair = %pair, "Retry already pending");
                }
                JobOutcome::RetryScheduled(written)
            }
            DeliveryStatus::Failed => {
                warn!(
                    subscription_id = %pair.subscription_id,
                    event_id = %pair.event_id,
                    attempt,
                    error = written.error_details.as_deref().unwrap_or_default(),
                    "Delivery failed permanently"
                );
                JobOutcome::Failed(written)
            }
        };
        Ok(outcome)
    }

    /// Reschedule a job whose store read failed. Lookup and validation
    /// errors pass through untouched so the job is dropped.
    fn requeue_on_store_error(&self, job: &DeliveryJob, attempt: u32, e: RelayError) -> RelayError {
        match e {
            RelayError::Database { .. } | RelayError::Cache(_) | RelayError::Io(_) => {
                self.requeue(job, attempt, e)
            }
            other => other,
        }
    }

    /// Schedule the same attempt again after the policy delay.
    fn requeue(&self, job: &DeliveryJob, attempt: u32, e: RelayError) -> RelayError {
        let delay = self.settings.retry_policy.delay(attempt);
        error!(
            subscription_id = %job.subscription_id,
            event_id = %job.event_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "Store unavailable, rescheduling job"
        );
        if !self.retries.schedule(job.clone(), delay) {
            debug!(pair = %job.pair(), "Retry already pending");
        }
        e
    }

    /// POST the event to the subscription target. Returns the 2xx status.
    async fn send(&self, subscription: &Subscription, event: &Event, attempt: u32) -> RelayResult<u16> {
        let mut request = self
            .client
            .post(&subscription.target_url)
            .header(CONTENT_TYPE, "application/json")
            .header(EVENT_HEADER, &event.event_type)
            .header(DELIVERY_HEADER, &event.id)
            .header(ATTEMPT_HEADER, attempt.to_string());
        if let Some(secret) = &subscription.secret_key {
            request = request.header(
                SIGNATURE_HEADER,
                signature::sign(secret.as_bytes(), &event.payload),
            );
        }

        let response = request
            .body(signature::canonicalize(&event.payload))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RelayError::transient(format!("Request timed out: {}", e), None)
                } else {
                    RelayError::transient(format!("Request failed: {}", e), None)
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(status.as_u16());
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        let message = if body.is_empty() {
            format!("HTTP {}", status.as_u16())
        } else {
            format!("HTTP {}: {}", status.as_u16(), body)
        };

        if status.is_client_error() && !self.settings.retry_client_errors {
            Err(RelayError::permanent(message, Some(status.as_u16())))
        } else {
            Err(RelayError::transient(message, Some(status.as_u16())))
        }
    }
}

/// Fixed set of worker tasks sharing the dispatch queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers.
    ///
    /// Workers run until the queue is closed and drained, or until `cancel`
    /// fires, after which they finish whatever is already queued and exit.
    pub fn start(
        worker: Arc<DeliveryWorker>,
        queue: Arc<DispatchQueue>,
        count: usize,
        cancel: CancellationToken,
    ) -> Self {
        let handles = (0..count.max(1))
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    worker.clone(),
                    queue.clone(),
                    cancel.clone(),
                ))
            })
            .collect();
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
    }
}

async fn worker_loop(
    id: usize,
    worker: Arc<DeliveryWorker>,
    queue: Arc<DispatchQueue>,
    cancel: CancellationToken,
) {
    debug!(worker = id, "Worker started");
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = queue.dequeue() => job,
        };
        let Some(job) = job else {
            debug!(worker = id, "Dispatch queue closed, worker exiting");
            return;
        };
        run_supervised(id, &worker, job).await;
    }

    while let Some(job) = queue.try_dequeue().await {
        run_supervised(id, &worker, job).await;
    }
    debug!(worker = id, "Worker drained and stopped");
}

/// Run one job in its own task so a panic cannot take the worker down.
async fn run_supervised(id: usize, worker: &Arc<DeliveryWorker>, job: DeliveryJob) {
    let pair = job.pair();
    let worker = worker.clone();
    let handle = tokio::spawn(async move { worker.handle(job).await });
    if let Err(e) = handle.await {
        if e.is_panic() {
            error!(worker = id, pair = %pair, "Delivery job panicked");
        } else {
            error!(worker = id, pair = %pair, error = %e, "Delivery job aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_locks_serialize_and_prune() {
        let locks = PairLocks::new();
        let pair = PairKey::new("s", "e");

        let first = locks.acquire(&pair).await;
        assert_eq!(locks.len(), 1);

        let waiter = {
            let locks = locks.clone();
            let pair = pair.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(&pair).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_pairs_do_not_block() {
        let locks = PairLocks::new();
        let _a = locks.acquire(&PairKey::new("s", "a")).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire(&PairKey::new("s", "b")),
        )
        .await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_default_settings() {
        let settings = DeliverySettings::default();
        assert_eq!(settings.max_tries, 5);
        assert!(settings.retry_client_errors);
        assert_eq!(settings.timeout, Duration::from_secs(10));
    }
}
