//! hookrelay-core - Core delivery pipeline for hookrelay.
//!
//! Accepts signed events on behalf of registered subscriptions, stores them,
//! and forwards them to subscriber endpoints with bounded retries. Every
//! delivery attempt is recorded in a ledger.
//!
//! # Example
//!
//! ```ignore
//! use hookrelay_core::{RelayConfig, RelayRuntime, Subscription};
//!
//! let runtime = RelayRuntime::new(RelayConfig::in_memory()).await?;
//! runtime.start().await?;
//!
//! let sub = runtime
//!     .registry()
//!     .create(Subscription::new("https://example.com/hook", "order.created").with_secret("s3cret"))
//!     .await?;
//!
//! // Accept a signed body for the subscription
//! let event = runtime.ingest().ingest(&sub.id, body, Some(signature)).await?;
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod ingest;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod signature;
pub mod store;
pub mod sweep;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use cache::{InMemorySubscriptionCache, SubscriptionCache, SubscriptionSnapshot};
pub use config::RelayConfig;
pub use error::{ErrorCode, RelayError, RelayResult};
pub use ingest::IngestService;
pub use queue::DispatchQueue;
pub use registry::SubscriptionRegistry;
pub use retry::{RetryPolicy, RetryScheduler};
pub use runtime::RelayRuntime;
pub use store::{DeliveryLedger, EventStore, SqliteStore, SubscriptionStore};
pub use sweep::{ExpirySweeper, SweepConfig};
pub use types::{
    DeliveryAttempt, DeliveryJob, DeliveryStatus, Event, IngestBody, NewAttempt, PairKey,
    Subscription, SubscriptionUpdate, WILDCARD_EVENT_TYPE,
};
pub use worker::{DeliverySettings, DeliveryWorker, JobOutcome, PairLocks, WorkerPool};

#[cfg(feature = "redis")]
pub use cache::RedisSubscriptionCache;
