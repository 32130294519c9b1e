//! Subscription registry: store access with a read-through cache.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::cache::SubscriptionCache;
use crate::error::{RelayError, RelayResult};
use crate::retry::RetryScheduler;
use crate::store::SubscriptionStore;
use crate::types::{Subscription, SubscriptionUpdate};

/// Owns subscription reads and writes.
///
/// Loading on a cache miss and populating the cache happens under the read
/// side of `gate`; committing a mutation and invalidating the entry happens
/// under the write side. A reader that loaded a snapshot before an update
/// therefore cannot write it back after the update was acknowledged.
pub struct SubscriptionRegistry {
    store: Arc<dyn SubscriptionStore>,
    cache: Arc<dyn SubscriptionCache>,
    retries: Arc<RetryScheduler>,
    gate: RwLock<()>,
}

impl SubscriptionRegistry {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        cache: Arc<dyn SubscriptionCache>,
        retries: Arc<RetryScheduler>,
    ) -> Self {
        Self {
            store,
            cache,
            retries,
            gate: RwLock::new(()),
        }
    }

    /// Look up a subscription, populating the cache on a miss.
    pub async fn get(&self, id: &str) -> RelayResult<Option<Subscription>> {
        match self.cache.get(id).await {
            Ok(Some(subscription)) => return Ok(Some(subscription)),
            Ok(None) => {}
            Err(e) => warn!(subscription_id = %id, error = %e, "Cache read failed, using store"),
        }

        let _guard = self.gate.read().await;
        let Some(subscription) = self.store.get_subscription(id)? else {
            return Ok(None);
        };
        if let Err(e) = self.cache.put(&subscription).await {
            warn!(subscription_id = %id, error = %e, "Failed to populate subscription cache");
        }
        Ok(Some(subscription))
    }

    /// Like [`get`](Self::get) but a missing subscription is an error.
    pub async fn require(&self, id: &str) -> RelayResult<Subscription> {
        self.get(id)
            .await?
            .ok_or_else(|| RelayError::subscription_not_found(id))
    }

    /// Register a new subscription.
    pub async fn create(&self, subscription: Subscription) -> RelayResult<Subscription> {
        subscription.validate()?;
        self.store.insert_subscription(&subscription)?;
        info!(
            subscription_id = %subscription.id,
            event_type = %subscription.event_type,
            "Subscription created"
        );
        Ok(subscription)
    }

    /// All subscriptions, straight from the store.
    pub async fn list(&self) -> RelayResult<Vec<Subscription>> {
        self.store.list_subscriptions()
    }

    /// Apply a partial update. The cache entry is gone before this returns.
    pub async fn update(&self, id: &str, update: &SubscriptionUpdate) -> RelayResult<Subscription> {
        let _guard = self.gate.write().await;

        let current = self
            .store
            .get_subscription(id)?
            .ok_or_else(|| RelayError::subscription_not_found(id))?;
        let updated = current.apply(update);
        updated.validate()?;

        if !self.store.update_subscription(&updated)? {
            return Err(RelayError::subscription_not_found(id));
        }
        self.cache.invalidate(id).await?;

        info!(subscription_id = %id, is_active = updated.is_active, "Subscription updated");
        Ok(updated)
    }

    /// Delete a subscription and cancel its pending retries.
    pub async fn delete(&self, id: &str) -> RelayResult<()> {
        let _guard = self.gate.write().await;

        if !self.store.delete_subscription(id)? {
            return Err(RelayError::subscription_not_found(id));
        }
        self.cache.invalidate(id).await?;
        let cancelled = self.retries.cancel_subscription(id);

        info!(subscription_id = %id, cancelled_retries = cancelled, "Subscription deleted");
        Ok(())
    }

    /// Delete every subscription created before `cutoff`.
    pub async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> RelayResult<usize> {
        let ids = self.store.subscriptions_created_before(cutoff)?;
        let mut deleted = 0;
        for id in ids {
            match self.delete(&id).await {
                Ok(()) => deleted += 1,
                // Removed concurrently.
                Err(RelayError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemorySubscriptionCache;
    use crate::queue::DispatchQueue;
    use crate::store::SqliteStore;
    use crate::types::DeliveryJob;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    struct Fixture {
        registry: Arc<SubscriptionRegistry>,
        cache: Arc<InMemorySubscriptionCache>,
        retries: Arc<RetryScheduler>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let cache = Arc::new(InMemorySubscriptionCache::new());
        let retries = Arc::new(RetryScheduler::new(Arc::new(DispatchQueue::new(16))));
        let registry = Arc::new(SubscriptionRegistry::new(
            store,
            cache.clone(),
            retries.clone(),
        ));
        Fixture {
            registry,
            cache,
            retries,
        }
    }

    #[tokio::test]
    async fn test_read_through_populates_cache() {
        let f = fixture();
        let sub = f
            .registry
            .create(Subscription::new("https://example.com/hook", "*"))
            .await
            .unwrap();
        assert_eq!(f.cache.len().await, 0);

        let loaded = f.registry.get(&sub.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, sub.id);
        assert!(f.cache.raw(&sub.id).await.is_some());

        assert!(f.registry.get("missing").await.unwrap().is_none());
        assert!(matches!(
            f.registry.require("missing").await,
            Err(RelayError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_invalidates_before_returning() {
        let f = fixture();
        let sub = f
            .registry
            .create(Subscription::new("https://example.com/hook", "*"))
            .await
            .unwrap();
        f.registry.get(&sub.id).await.unwrap();

        f.registry
            .update(
                &sub.id,
                &SubscriptionUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(f.cache.raw(&sub.id).await.is_none());
        assert!(!f.registry.get(&sub.id).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn test_update_rejects_invalid_and_unknown() {
        let f = fixture();
        let sub = f
            .registry
            .create(Subscription::new("https://example.com/hook", "*"))
            .await
            .unwrap();

        let bad = SubscriptionUpdate {
            target_url: Some("not a url".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            f.registry.update(&sub.id, &bad).await,
            Err(RelayError::Validation { .. })
        ));
        assert!(matches!(
            f.registry.update("missing", &SubscriptionUpdate::default()).await,
            Err(RelayError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_cancels_retries() {
        let f = fixture();
        let sub = f
            .registry
            .create(Subscription::new("https://example.com/hook", "*"))
            .await
            .unwrap();
        f.registry.get(&sub.id).await.unwrap();
        f.retries
            .schedule(DeliveryJob::new(&sub.id, "evt"), Duration::from_secs(60));

        f.registry.delete(&sub.id).await.unwrap();
        assert_eq!(f.retries.pending_count(), 0);
        assert!(f.registry.get(&sub.id).await.unwrap().is_none());
        assert!(matches!(
            f.registry.delete(&sub.id).await,
            Err(RelayError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_created_before() {
        let f = fixture();
        let old = Subscription::new("https://example.com/a", "*")
            .with_created_at(Utc::now() - ChronoDuration::hours(80));
        f.registry.create(old.clone()).await.unwrap();
        let fresh = f
            .registry
            .create(Subscription::new("https://example.com/b", "*"))
            .await
            .unwrap();

        let deleted = f
            .registry
            .delete_created_before(Utc::now() - ChronoDuration::hours(72))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(f.registry.get(&old.id).await.unwrap().is_none());
        assert!(f.registry.get(&fresh.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_validates() {
        let f = fixture();
        assert!(f
            .registry
            .create(Subscription::new("ftp://example.com", "*"))
            .await
            .is_err());
    }
}
