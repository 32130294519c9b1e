//! Retry policy and the timer-driven retry scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::queue::DispatchQueue;
use crate::types::{DeliveryJob, PairKey};

/// How long to wait before re-attempting a failed delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Same delay after every failure.
    Fixed { delay_ms: u64 },
    /// Delay grows by `multiplier` per failure, capped at `max_delay_ms`.
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f32,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Fixed { delay_ms: 60_000 }
    }
}

impl RetryPolicy {
    /// Fixed delay policy.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Delay to wait after `attempt` (1-based) failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let attempt = attempt.max(1) as usize;
                let max = Duration::from_millis(*max_delay_ms);
                let delay = ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(*initial_delay_ms))
                    .with_max_delay(max)
                    .with_factor(*multiplier)
                    .with_max_times(attempt)
                    .build()
                    .nth(attempt - 1)
                    .unwrap_or(max);
                // The factor is applied in f32; snap back to whole milliseconds.
                Duration::from_millis((delay.as_secs_f64() * 1000.0).round() as u64)
            }
        }
    }
}

struct PendingRetry {
    generation: u64,
    token: CancellationToken,
    /// Timer elapsed and the job is waiting for queue capacity.
    firing: bool,
}

type PendingMap = Arc<Mutex<HashMap<PairKey, PendingRetry>>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<PairKey, PendingRetry>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Re-enqueues failed deliveries after a delay.
///
/// Each scheduled retry is its own timer task, so waiting never occupies a
/// worker. At most one retry is pending per pair.
pub struct RetryScheduler {
    queue: Arc<DispatchQueue>,
    pending: PendingMap,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl RetryScheduler {
    pub fn new(queue: Arc<DispatchQueue>) -> Self {
        Self {
            queue,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Arrange for `job` to be re-enqueued after `delay`.
    ///
    /// Returns false if a retry is already pending for the pair or the
    /// scheduler has been shut down.
    pub fn schedule(&self, job: DeliveryJob, delay: Duration) -> bool {
        let pair = job.pair();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let token = self.shutdown.child_token();

        {
            let mut pending = lock(&self.pending);
            if self.shutdown.is_cancelled() {
                return false;
            }
            // A firing entry is about to hand its job to a worker, which may
            // schedule the next retry before the entry is cleared.
            if pending.get(&pair).is_some_and(|entry| !entry.firing) {
                return false;
            }
            pending.insert(
                pair.clone(),
                PendingRetry {
                    generation,
                    token: token.clone(),
                    firing: false,
                },
            );
        }

        debug!(
            subscription_id = %pair.subscription_id,
            event_id = %pair.event_id,
            delay_ms = delay.as_millis() as u64,
            "Scheduled retry"
        );

        let queue = self.queue.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(pair = %pair, "Retry cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            {
                let mut map = lock(&pending);
                match map.get_mut(&pair) {
                    Some(entry) if entry.generation == generation => entry.firing = true,
                    _ => return,
                }
            }

            // Stays cancellable while waiting for queue capacity.
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(pair = %pair, "Retry cancelled while waiting for queue capacity");
                    return;
                }
                result = queue.enqueue(job) => {
                    if let Err(e) = result {
                        warn!(pair = %pair, error = %e, "Dropping retry, dispatch queue unavailable");
                    }
                }
            }

            let mut map = lock(&pending);
            if map.get(&pair).is_some_and(|entry| entry.generation == generation) {
                map.remove(&pair);
            }
        });

        true
    }

    /// Cancel the pending retry for a pair.
    pub fn cancel(&self, pair: &PairKey) -> bool {
        match lock(&self.pending).remove(pair) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending retry belonging to a subscription.
    pub fn cancel_subscription(&self, subscription_id: &str) -> usize {
        let mut pending = lock(&self.pending);
        let pairs: Vec<PairKey> = pending
            .keys()
            .filter(|pair| pair.subscription_id == subscription_id)
            .cloned()
            .collect();
        for pair in &pairs {
            if let Some(entry) = pending.remove(pair) {
                entry.token.cancel();
            }
        }
        pairs.len()
    }

    /// Whether a retry is pending for the pair.
    pub fn is_scheduled(&self, pair: &PairKey) -> bool {
        lock(&self.pending).contains_key(pair)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Cancel all timers and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let drained = {
            let mut pending = lock(&self.pending);
            let count = pending.len();
            pending.clear();
            count
        };
        if drained > 0 {
            debug!(count = drained, "Cancelled pending retries");
        }
    }
}
