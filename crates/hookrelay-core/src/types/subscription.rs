//! Subscription types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};

/// Event type filter that accepts every event.
pub const WILDCARD_EVENT_TYPE: &str = "*";

/// A registered delivery target.
///
/// Subscriptions are owned by the administrative API; the pipeline only
/// reads them (through the cache) and never mutates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Stable identifier (UUID string).
    pub id: String,
    /// Endpoint that receives delivered events.
    pub target_url: String,
    /// Shared secret used to verify inbound and sign outbound payloads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// Event type this subscription accepts; `*` accepts all.
    pub event_type: String,
    /// Whether ingestion is accepted for this subscription.
    pub is_active: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Create a new active subscription with a fresh id.
    pub fn new(target_url: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target_url: target_url.into(),
            secret_key: None,
            event_type: event_type.into(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    /// Builder: set the signing secret.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret_key = Some(secret.into());
        self
    }

    /// Builder: set the creation timestamp.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Check whether this subscription accepts the given event type.
    pub fn accepts(&self, event_type: &str) -> bool {
        self.event_type == WILDCARD_EVENT_TYPE || self.event_type == event_type
    }

    /// Validate fields supplied by an administrator.
    pub fn validate(&self) -> RelayResult<()> {
        let url = url::Url::parse(&self.target_url)
            .map_err(|e| RelayError::validation(format!("Invalid target_url: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RelayError::validation(format!(
                "target_url must use http or https, got '{}'",
                url.scheme()
            )));
        }
        if self.event_type.trim().is_empty() {
            return Err(RelayError::missing_field("event_type"));
        }
        Ok(())
    }

    /// Apply a partial update, returning the updated copy.
    pub fn apply(&self, update: &SubscriptionUpdate) -> Self {
        let mut updated = self.clone();
        if let Some(url) = &update.target_url {
            updated.target_url = url.clone();
        }
        if let Some(event_type) = &update.event_type {
            updated.event_type = event_type.clone();
        }
        if let Some(secret) = &update.secret_key {
            updated.secret_key = Some(secret.clone());
        }
        if let Some(active) = update.is_active {
            updated.is_active = active;
        }
        updated
    }
}

/// Partial update for a subscription. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}
