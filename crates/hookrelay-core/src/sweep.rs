//! Periodic removal of expired subscriptions.
//!
//! Uses tokio-cron-scheduler to delete subscriptions older than the expiry
//! window. Deletion goes through the registry, so cache entries and pending
//! retries are cleaned up the same way as an administrative delete.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{debug, error, info};

use crate::error::{RelayError, RelayResult};
use crate::registry::SubscriptionRegistry;

/// Configuration for the expiry sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub enabled: bool,
    /// Minutes between sweeps (default: 60)
    pub interval_minutes: u64,
    /// Subscriptions older than this are deleted (default: 72)
    pub expiry_hours: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 60,
            expiry_hours: 72,
        }
    }
}

/// Scheduler for the expiry sweep.
pub struct ExpirySweeper {
    scheduler: JobScheduler,
    registry: Arc<SubscriptionRegistry>,
    config: SweepConfig,
}

impl ExpirySweeper {
    /// Create a sweeper. Call `start()` to begin periodic execution.
    pub async fn new(
        registry: Arc<SubscriptionRegistry>,
        config: SweepConfig,
    ) -> Result<Self, JobSchedulerError> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler,
            registry,
            config,
        })
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Start the periodic sweep.
    pub async fn start(&self) -> Result<(), JobSchedulerError> {
        let registry = self.registry.clone();
        let expiry_hours = self.config.expiry_hours;
        let interval = Duration::from_secs(self.config.interval_minutes.max(1) * 60);

        let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
            let registry = registry.clone();
            Box::pin(async move {
                debug!("Starting expiry sweep");
                match sweep(&registry, expiry_hours).await {
                    Ok(deleted) => info!(deleted, "Expiry sweep complete"),
                    Err(e) => error!(error = %e, "Expiry sweep failed"),
                }
            })
        })?;

        self.scheduler.add(job).await?;
        self.scheduler.start().await?;

        info!(
            interval_minutes = self.config.interval_minutes,
            expiry_hours = self.config.expiry_hours,
            "Expiry sweep scheduled"
        );
        Ok(())
    }

    /// Run one sweep immediately.
    pub async fn run_now(&self) -> RelayResult<usize> {
        sweep(&self.registry, self.config.expiry_hours).await
    }

    /// Stop the scheduler.
    pub async fn shutdown(&mut self) -> Result<(), JobSchedulerError> {
        debug!("Shutting down expiry sweep");
        self.scheduler.shutdown().await
    }
}

/// Oldest creation time that survives a sweep.
fn expiry_cutoff(now: DateTime<Utc>, expiry_hours: u64) -> RelayResult<DateTime<Utc>> {
    i64::try_from(expiry_hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .and_then(|age| now.checked_sub_signed(age))
        .ok_or_else(|| {
            RelayError::Configuration(format!("expiry_hours {} is out of range", expiry_hours))
        })
}

async fn sweep(registry: &SubscriptionRegistry, expiry_hours: u64) -> RelayResult<usize> {
    let cutoff = expiry_cutoff(Utc::now(), expiry_hours)?;
    registry.delete_created_before(cutoff).await
}
