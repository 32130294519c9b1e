//! Event ingestion endpoint.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use hookrelay_core::signature::SIGNATURE_HEADER;
use serde::Serialize;
use tracing::debug;

use crate::error::ApiResult;
use crate::state::AppState;

/// Response for an accepted event. Says nothing about delivery outcome.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub message: String,
    pub event_id: String,
}

/// Accept a signed event for a subscription.
/// POST /ingest/:subscription_id
pub async fn ingest_event(
    State(state): State<AppState>,
    Path(subscription_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<IngestResponse>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let event = state
        .runtime()
        .ingest()
        .ingest(&subscription_id, &body, signature)
        .await?;

    debug!(subscription_id = %subscription_id, event_id = %event.id, "Event accepted");

    Ok(Json(IngestResponse {
        message: "Request accepted for processing".to_string(),
        event_id: event.id,
    }))
}
