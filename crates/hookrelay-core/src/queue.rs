//! Bounded dispatch queue shared by ingestion, the retry scheduler and the
//! worker pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::debug;

use crate::error::{RelayError, RelayResult};
use crate::types::DeliveryJob;

/// Default number of jobs the queue holds before applying backpressure.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Multi-producer, multi-consumer job queue.
///
/// Workers share one receiver behind an async mutex; only the worker
/// holding the lock waits on the channel.
pub struct DispatchQueue {
    sender: Mutex<Option<mpsc::Sender<DeliveryJob>>>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<DeliveryJob>>>,
    depth: AtomicUsize,
    capacity: usize,
}

impl DispatchQueue {
    /// Create a queue holding at most `capacity` jobs.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: Arc::new(AsyncMutex::new(rx)),
            depth: AtomicUsize::new(0),
            capacity,
        }
    }

    fn sender(&self) -> RelayResult<mpsc::Sender<DeliveryJob>> {
        let guard = self
            .sender
            .lock()
            .map_err(|e| RelayError::internal(e.to_string()))?;
        guard.clone().ok_or(RelayError::Shutdown)
    }

    /// Reserve a slot without waiting.
    ///
    /// Returns `Backpressure` when the queue is full and `Shutdown` once it
    /// has been closed. Dropping the slot unused gives the capacity back.
    pub fn try_reserve(&self) -> RelayResult<QueueSlot<'_>> {
        match self.sender()?.try_reserve_owned() {
            Ok(permit) => Ok(QueueSlot {
                permit,
                depth: &self.depth,
            }),
            Err(TrySendError::Full(_)) => Err(RelayError::Backpressure),
            Err(TrySendError::Closed(_)) => Err(RelayError::Shutdown),
        }
    }

    /// Enqueue without waiting. Fails like [`try_reserve`](Self::try_reserve).
    pub fn try_enqueue(&self, job: DeliveryJob) -> RelayResult<()> {
        self.try_reserve()?.send(job);
        Ok(())
    }

    /// Enqueue, waiting for capacity if necessary.
    pub async fn enqueue(&self, job: DeliveryJob) -> RelayResult<()> {
        let sender = self.sender()?;
        self.depth.fetch_add(1, Ordering::SeqCst);
        if sender.send(job).await.is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(RelayError::Shutdown);
        }
        Ok(())
    }

    /// Wait for the next job. `None` once the queue is closed and drained.
    pub async fn dequeue(&self) -> Option<DeliveryJob> {
        let mut receiver = self.receiver.lock().await;
        let job = receiver.recv().await;
        if job.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        job
    }

    /// Take a queued job without waiting for one to arrive.
    pub async fn try_dequeue(&self) -> Option<DeliveryJob> {
        let mut receiver = self.receiver.lock().await;
        let job = receiver.try_recv().ok();
        if job.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        job
    }

    /// Stop accepting jobs. Jobs already queued are still handed out.
    pub fn close(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            if guard.take().is_some() {
                debug!("Dispatch queue closed");
            }
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.sender.lock().map(|g| g.is_none()).unwrap_or(true)
    }

    /// Jobs currently waiting.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Capacity held in the queue for one job.
pub struct QueueSlot<'a> {
    permit: mpsc::OwnedPermit<DeliveryJob>,
    depth: &'a AtomicUsize,
}

impl QueueSlot<'_> {
    /// Place the job in the reserved slot.
    pub fn send(self, job: DeliveryJob) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.permit.send(job);
    }
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
