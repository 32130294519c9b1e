//! Persistence for subscriptions, events and the delivery ledger.

mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use crate::error::RelayResult;
use crate::types::{DeliveryAttempt, Event, NewAttempt, PairKey, Subscription};

/// Subscription records owned by the administrative API.
pub trait SubscriptionStore: Send + Sync {
    /// Insert a new subscription.
    fn insert_subscription(&self, subscription: &Subscription) -> RelayResult<()>;

    /// Get a subscription by id.
    fn get_subscription(&self, id: &str) -> RelayResult<Option<Subscription>>;

    /// All subscriptions, oldest first.
    fn list_subscriptions(&self) -> RelayResult<Vec<Subscription>>;

    /// Overwrite a subscription. Returns false if it does not exist.
    fn update_subscription(&self, subscription: &Subscription) -> RelayResult<bool>;

    /// Delete a subscription. Returns false if it does not exist.
    fn delete_subscription(&self, id: &str) -> RelayResult<bool>;

    /// Ids of subscriptions created before `cutoff`.
    fn subscriptions_created_before(&self, cutoff: DateTime<Utc>) -> RelayResult<Vec<String>>;
}

/// Append-only event storage.
pub trait EventStore: Send + Sync {
    /// Persist a new event with a fresh id.
    fn append(&self, event_type: &str, payload: serde_json::Value) -> RelayResult<Event>;

    /// Get an event by id.
    fn get_event(&self, id: &str) -> RelayResult<Option<Event>>;

    /// Number of stored events.
    fn event_count(&self) -> RelayResult<u64>;
}

/// Record of every delivery attempt.
pub trait DeliveryLedger: Send + Sync {
    /// Write an attempt row.
    ///
    /// Fails with `Conflict` unless `attempt_number` is exactly one past the
    /// pair's current count and the pair has no terminal row.
    fn record_attempt(&self, attempt: NewAttempt) -> RelayResult<DeliveryAttempt>;

    /// Most recent attempts for a subscription, newest first.
    fn recent_for_subscription(
        &self,
        subscription_id: &str,
        limit: usize,
    ) -> RelayResult<Vec<DeliveryAttempt>>;

    /// All attempts for an event, by attempt number ascending.
    fn attempts_for_event(&self, event_id: &str) -> RelayResult<Vec<DeliveryAttempt>>;

    /// Number of attempts recorded for a pair.
    fn attempt_count(&self, pair: &PairKey) -> RelayResult<u32>;

    /// Latest attempt for a pair.
    fn last_attempt(&self, pair: &PairKey) -> RelayResult<Option<DeliveryAttempt>>;

    /// Latest row of every pair that is still waiting on a retry and whose
    /// subscription still exists.
    fn unfinished_pairs(&self) -> RelayResult<Vec<DeliveryAttempt>>;
}
