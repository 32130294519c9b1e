//! Event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An accepted inbound event. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier (UUID string).
    pub id: String,
    /// Event type taken from the ingested body.
    pub event_type: String,
    /// Full ingested body, forwarded verbatim to the target.
    pub payload: serde_json::Value,
    /// Acceptance timestamp.
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Create a new event with a fresh id.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Body accepted by the ingestion endpoint: `{"event": ..., "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestBody {
    pub event: String,
    pub data: serde_json::Map<String, serde_json::Value>,
}
