//! Subscription cache.
//!
//! Entries are explicit-schema JSON snapshots keyed by subscription id.
//! There is no TTL: freshness depends on the registry invalidating an
//! entry before a mutation is acknowledged.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::RelayResult;
use crate::types::Subscription;

/// Current snapshot schema version.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Serialized form of a cached subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub schema_version: u32,
    pub id: String,
    pub target_url: String,
    pub secret_key: Option<String>,
    pub event_type: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl SubscriptionSnapshot {
    /// Encode a subscription as a JSON snapshot.
    pub fn encode(subscription: &Subscription) -> RelayResult<String> {
        let snapshot = Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            id: subscription.id.clone(),
            target_url: subscription.target_url.clone(),
            secret_key: subscription.secret_key.clone(),
            event_type: subscription.event_type.clone(),
            is_active: subscription.is_active,
            created_at: subscription.created_at,
        };
        Ok(serde_json::to_string(&snapshot)?)
    }

    /// Decode a snapshot. Returns `None` for unreadable or foreign-version data.
    pub fn decode(raw: &str) -> Option<Subscription> {
        let snapshot: Self = match serde_json::from_str(raw) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable subscription snapshot");
                return None;
            }
        };
        if snapshot.schema_version != SNAPSHOT_SCHEMA_VERSION {
            warn!(
                schema_version = snapshot.schema_version,
                "Discarding subscription snapshot with unknown schema version"
            );
            return None;
        }
        Some(Subscription {
            id: snapshot.id,
            target_url: snapshot.target_url,
            secret_key: snapshot.secret_key,
            event_type: snapshot.event_type,
            is_active: snapshot.is_active,
            created_at: snapshot.created_at,
        })
    }
}

/// Cache key for a subscription id.
pub fn cache_key(subscription_id: &str) -> String {
    format!("subscription:{}", subscription_id)
}

/// Storage for subscription snapshots.
#[async_trait]
pub trait SubscriptionCache: Send + Sync {
    /// Look up a subscription. `None` on miss.
    async fn get(&self, subscription_id: &str) -> RelayResult<Option<Subscription>>;

    /// Store or overwrite a subscription snapshot.
    async fn put(&self, subscription: &Subscription) -> RelayResult<()>;

    /// Remove the entry for a subscription.
    async fn invalidate(&self, subscription_id: &str) -> RelayResult<()>;
}

/// Process-local cache.
#[derive(Default)]
pub struct InMemorySubscriptionCache {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemorySubscriptionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Raw snapshot stored for a subscription, for inspection.
    pub async fn raw(&self, subscription_id: &str) -> Option<String> {
        self.entries
            .read()
            .await
            .get(&cache_key(subscription_id))
            .cloned()
    }

    #[cfg(test)]
    pub(crate) async fn put_raw(&self, subscription_id: &str, raw: impl Into<String>) {
        self.entries
            .write()
            .await
            .insert(cache_key(subscription_id), raw.into());
    }
}

#[async_trait]
impl SubscriptionCache for InMemorySubscriptionCache {
    async fn get(&self, subscription_id: &str) -> RelayResult<Option<Subscription>> {
        let key = cache_key(subscription_id);
        let raw = self.entries.read().await.get(&key).cloned();
        let Some(raw) = raw else {
            return Ok(None);
        };

        match SubscriptionSnapshot::decode(&raw) {
            Some(subscription) => Ok(Some(subscription)),
            None => {
                self.entries.write().await.remove(&key);
                Ok(None)
            }
        }
    }

    async fn put(&self, subscription: &Subscription) -> RelayResult<()> {
        let raw = SubscriptionSnapshot::encode(subscription)?;
        self.entries
            .write()
            .await
            .insert(cache_key(&subscription.id), raw);
        Ok(())
    }

    async fn invalidate(&self, subscription_id: &str) -> RelayResult<()> {
        self.entries.write().await.remove(&cache_key(subscription_id));
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use redis_cache::RedisSubscriptionCache;

#[cfg(feature = "redis")]
mod redis_cache {
    use async_trait::async_trait;
    use redis::aio::MultiplexedConnection;
    use redis::{AsyncCommands, Client};

    use super::{cache_key, SubscriptionCache, SubscriptionSnapshot};
    use crate::error::{RelayError, RelayResult};
    use crate::types::Subscription;

    /// Redis-backed cache shared between relay instances.
    pub struct RedisSubscriptionCache {
        connection: MultiplexedConnection,
    }

    impl RedisSubscriptionCache {
        /// Connect to Redis at the given URL.
        pub async fn connect(url: &str) -> RelayResult<Self> {
            let client = Client::open(url)
                .map_err(|e| RelayError::Cache(format!("Failed to create Redis client: {}", e)))?;
            let connection = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| RelayError::Cache(format!("Failed to connect to Redis: {}", e)))?;
            Ok(Self { connection })
        }
    }

    #[async_trait]
    impl SubscriptionCache for RedisSubscriptionCache {
        async fn get(&self, subscription_id: &str) -> RelayResult<Option<Subscription>> {
            let mut conn = self.connection.clone();
            let key = cache_key(subscription_id);
            let raw: Option<String> = conn
                .get(&key)
                .await
                .map_err(|e| RelayError::Cache(e.to_string()))?;

            let Some(raw) = raw else {
                return Ok(None);
            };
            match SubscriptionSnapshot::decode(&raw) {
                Some(subscription) => Ok(Some(subscription)),
                None => {
                    let _: () = conn
                        .del(&key)
                        .await
                        .map_err(|e| RelayError::Cache(e.to_string()))?;
                    Ok(None)
                }
            }
        }

        async fn put(&self, subscription: &Subscription) -> RelayResult<()> {
            let mut conn = self.connection.clone();
            let raw = SubscriptionSnapshot::encode(subscription)?;
            let _: () = conn
                .set(cache_key(&subscription.id), raw)
                .await
                .map_err(|e| RelayError::Cache(e.to_string()))?;
            Ok(())
        }

        async fn invalidate(&self, subscription_id: &str) -> RelayResult<()> {
            let mut conn = self.connection.clone();
            let _: () = conn
                .del(cache_key(subscription_id))
                .await
                .map_err(|e| RelayError::Cache(e.to_string()))?;
            Ok(())
        }
    }
}
