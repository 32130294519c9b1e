//! Relay runtime: owns the store, queue, scheduler and workers.
//!
//! Provides unified startup (worker pool, recovery, expiry sweep) and a
//! graceful shutdown that drains the queue before cancelling retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{InMemorySubscriptionCache, SubscriptionCache};
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::ingest::IngestService;
use crate::queue::DispatchQueue;
use crate::registry::SubscriptionRegistry;
use crate::retry::RetryScheduler;
use crate::store::{DeliveryLedger, EventStore, SqliteStore};
use crate::sweep::ExpirySweeper;
use crate::types::DeliveryJob;
use crate::worker::{DeliveryWorker, WorkerPool};

/// Everything the relay needs at runtime, wired together.
///
/// # Example
///
/// ```ignore
/// use hookrelay_core::{RelayConfig, RelayRuntime};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let runtime = RelayRuntime::new(RelayConfig::from_env()).await?;
///     runtime.start().await?;
///
///     // ... serve ingestion ...
///
///     runtime.shutdown().await?;
///     Ok(())
/// }
/// ```
pub struct RelayRuntime {
    config: RelayConfig,
    store: Arc<SqliteStore>,
    queue: Arc<DispatchQueue>,
    retries: Arc<RetryScheduler>,
    registry: Arc<SubscriptionRegistry>,
    ingest: Arc<IngestService>,
    worker: Arc<DeliveryWorker>,
    cancel: CancellationToken,
    pool: Mutex<Option<WorkerPool>>,
    sweeper: Mutex<Option<ExpirySweeper>>,
}

impl RelayRuntime {
    /// Build the runtime. Call `start()` to begin delivering.
    pub async fn new(config: RelayConfig) -> RelayResult<Self> {
        debug!(
            queue_capacity = config.queue_capacity,
            worker_count = config.worker_count,
            max_tries = config.max_tries,
            "Creating RelayRuntime"
        );

        let store = match &config.database_path {
            Some(path) => {
                debug!(path = %path.display(), "Opening file-backed store");
                Arc::new(SqliteStore::new(path)?)
            }
            None => {
                debug!("Creating in-memory store");
                Arc::new(SqliteStore::in_memory()?)
            }
        };

        let cache = build_cache(&config).await?;
        let queue = Arc::new(DispatchQueue::new(config.queue_capacity));
        let retries = Arc::new(RetryScheduler::new(queue.clone()));
        let registry = Arc::new(SubscriptionRegistry::new(
            store.clone(),
            cache,
            retries.clone(),
        ));
        let ingest = Arc::new(IngestService::new(
            registry.clone(),
            store.clone(),
            queue.clone(),
        ));
        let worker = Arc::new(DeliveryWorker::new(
            registry.clone(),
            store.clone(),
            store.clone(),
            retries.clone(),
            config.delivery_settings(),
        )?);

        Ok(Self {
            config,
            store,
            queue,
            retries,
            registry,
            ingest,
            worker,
            cancel: CancellationToken::new(),
            pool: Mutex::new(None),
            sweeper: Mutex::new(None),
        })
    }

    /// Start workers, recover unfinished deliveries and schedule the sweep.
    pub async fn start(&self) -> RelayResult<()> {
        {
            let mut pool = self.pool.lock().await;
            if pool.is_some() {
                return Ok(());
            }
            *pool = Some(WorkerPool::start(
                self.worker.clone(),
                self.queue.clone(),
                self.config.worker_count,
                self.cancel.clone(),
            ));
        }
        info!(workers = self.config.worker_count, "Delivery workers started");

        if self.config.recover_on_start {
            let recovered = self.recover()?;
            if recovered > 0 {
                info!(count = recovered, "Recovered unfinished deliveries");
            }
        }

        if self.config.sweep.enabled {
            let sweeper = ExpirySweeper::new(self.registry.clone(), self.config.sweep.clone())
                .await
                .map_err(|e| RelayError::internal(format!("Failed to create expiry sweep: {}", e)))?;
            sweeper
                .start()
                .await
                .map_err(|e| RelayError::internal(format!("Failed to start expiry sweep: {}", e)))?;
            *self.sweeper.lock().await = Some(sweeper);
        }

        Ok(())
    }

    /// Schedule a retry for every pair whose latest attempt is pending.
    pub fn recover(&self) -> RelayResult<usize> {
        let mut scheduled = 0;
        for last in self.store.unfinished_pairs()? {
            let job = DeliveryJob::new(last.subscription_id, last.event_id);
            let delay = self.config.retry_policy.delay(last.attempt_number);
            if self.retries.schedule(job, delay) {
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    /// Stop accepting work, drain the queue, then cancel pending retries.
    pub async fn shutdown(&self) -> RelayResult<()> {
        debug!("Shutting down relay runtime");
        self.cancel.cancel();
        self.queue.close();

        if let Some(pool) = self.pool.lock().await.take() {
            let timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
            if tokio::time::timeout(timeout, pool.join()).await.is_err() {
                warn!(
                    timeout_secs = self.config.shutdown_timeout_secs,
                    "Workers did not drain before timeout"
                );
            }
        }

        self.retries.shutdown();

        if let Some(mut sweeper) = self.sweeper.lock().await.take() {
            sweeper
                .shutdown()
                .await
                .map_err(|e| RelayError::internal(format!("Failed to stop expiry sweep: {}", e)))?;
        }

        info!("Relay runtime stopped");
        Ok(())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        self.registry.clone()
    }

    pub fn ingest(&self) -> Arc<IngestService> {
        self.ingest.clone()
    }

    pub fn ledger(&self) -> Arc<dyn DeliveryLedger> {
        self.store.clone()
    }

    pub fn events(&self) -> Arc<dyn EventStore> {
        self.store.clone()
    }

    pub fn queue(&self) -> Arc<DispatchQueue> {
        self.queue.clone()
    }

    pub fn retries(&self) -> Arc<RetryScheduler> {
        self.retries.clone()
    }
}

#[cfg(feature = "redis")]
async fn build_cache(config: &RelayConfig) -> RelayResult<Arc<dyn SubscriptionCache>> {
    if let Some(url) = &config.redis_url {
        debug!("Using Redis subscription cache");
        let cache = crate::cache::RedisSubscriptionCache::connect(url).await?;
        return Ok(Arc::new(cache));
    }
    Ok(Arc::new(InMemorySubscriptionCache::new()))
}

#[cfg(not(feature = "redis"))]
async fn build_cache(config: &RelayConfig) -> RelayResult<Arc<dyn SubscriptionCache>> {
    if config.redis_url.is_some() {
        warn!("redis_url is set but the redis feature is disabled; using in-memory cache");
    }
    Ok(Arc::new(InMemorySubscriptionCache::new()))
}
