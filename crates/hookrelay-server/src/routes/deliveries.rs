//! Delivery status reads.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use hookrelay_core::{DeliveryAttempt, DeliveryStatus};
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// How many attempts the per-subscription view returns.
pub const RECENT_DELIVERIES_LIMIT: usize = 20;

/// One ledger row as exposed over HTTP.
#[derive(Debug, Serialize)]
pub struct DeliveryRecord {
    pub event_id: String,
    pub attempt: u32,
    pub status: DeliveryStatus,
    pub http_code: Option<u16>,
    pub error_details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl From<DeliveryAttempt> for DeliveryRecord {
    fn from(a: DeliveryAttempt) -> Self {
        Self {
            event_id: a.event_id,
            attempt: a.attempt_number,
            status: a.status,
            http_code: a.http_code,
            error_details: a.error_details,
            timestamp: a.created_at,
        }
    }
}

/// Most recent attempts for a subscription, newest first.
/// GET /subscription_deliveries/:subscription_id
pub async fn subscription_deliveries(
    State(state): State<AppState>,
    Path(subscription_id): Path<String>,
) -> ApiResult<Json<Vec<DeliveryRecord>>> {
    let attempts = state
        .runtime()
        .ledger()
        .recent_for_subscription(&subscription_id, RECENT_DELIVERIES_LIMIT)?;

    if attempts.is_empty() {
        return Err(ApiError::not_found(format!(
            "No delivery attempts for subscription '{}'",
            subscription_id
        )));
    }

    Ok(Json(attempts.into_iter().map(DeliveryRecord::from).collect()))
}

/// Every attempt for an event, by attempt number.
/// GET /delivery_status/:event_id
pub async fn delivery_status(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<Vec<DeliveryRecord>>> {
    let attempts = state.runtime().ledger().attempts_for_event(&event_id)?;

    if attempts.is_empty() {
        return Err(ApiError::not_found(format!(
            "No delivery attempts for event '{}'",
            event_id
        )));
    }

    Ok(Json(attempts.into_iter().map(DeliveryRecord::from).collect()))
}
