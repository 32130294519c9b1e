//! Delivery jobs and the attempt records written to the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Status of a single delivery attempt.
///
/// `Pending` marks a failed attempt that scheduled a retry. `Success` and
/// `Failed` are terminal: no attempt follows them for the same pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

impl DeliveryStatus {
    /// Whether this status ends the pair's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// Identifies the (subscription, event) pair an attempt belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub subscription_id: String,
    pub event_id: String,
}

impl PairKey {
    pub fn new(subscription_id: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            event_id: event_id.into(),
        }
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.subscription_id, self.event_id)
    }
}

/// A unit of work on the dispatch queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub subscription_id: String,
    pub event_id: String,
}

impl DeliveryJob {
    pub fn new(subscription_id: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            event_id: event_id.into(),
        }
    }

    /// The pair this job delivers.
    pub fn pair(&self) -> PairKey {
        PairKey::new(self.subscription_id.clone(), self.event_id.clone())
    }
}

impl From<PairKey> for DeliveryJob {
    fn from(pair: PairKey) -> Self {
        Self {
            subscription_id: pair.subscription_id,
            event_id: pair.event_id,
        }
    }
}

/// A recorded delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: String,
    pub subscription_id: String,
    pub event_id: String,
    /// 1-based, contiguous per pair.
    pub attempt_number: u32,
    pub status: DeliveryStatus,
    pub http_code: Option<u16>,
    pub error_details: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Attempt about to be written to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttempt {
    pub pair: PairKey,
    pub attempt_number: u32,
    pub status: DeliveryStatus,
    pub http_code: Option<u16>,
    pub error_details: Option<String>,
}

impl NewAttempt {
    /// Successful delivery.
    pub fn success(pair: PairKey, attempt_number: u32, http_code: u16) -> Self {
        Self {
            pair,
            attempt_number,
            status: DeliveryStatus::Success,
            http_code: Some(http_code),
            error_details: None,
        }
    }

    /// Failed attempt; `status` decides whether it is a retry or terminal.
    pub fn failure(
        pair: PairKey,
        attempt_number: u32,
        status: DeliveryStatus,
        http_code: Option<u16>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            pair,
            attempt_number,
            status,
            http_code,
            error_details: Some(error.into()),
        }
    }

    /// Materialize into a stored record.
    pub fn into_attempt(self) -> DeliveryAttempt {
        DeliveryAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            subscription_id: self.pair.subscription_id,
            event_id: self.pair.event_id,
            attempt_number: self.attempt_number,
            status: self.status,
            http_code: self.http_code,
            error_details: self.error_details,
            created_at: Utc::now(),
        }
    }
}
