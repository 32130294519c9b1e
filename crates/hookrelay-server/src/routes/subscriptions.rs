//! Subscription management endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use hookrelay_core::{Subscription, SubscriptionUpdate};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Request body for registering a subscription.
#[derive(Debug, Deserialize)]
pub struct AddSubscriptionRequest {
    pub target_url: Option<String>,
    pub event_type: Option<String>,
    pub secret_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AddSubscriptionResponse {
    pub id: String,
}

/// Listing entry. The secret is never returned.
#[derive(Debug, Serialize)]
pub struct SubscriptionSummary {
    pub id: String,
    pub url: String,
    pub event: String,
    pub is_active: bool,
}

impl From<Subscription> for SubscriptionSummary {
    fn from(s: Subscription) -> Self {
        Self {
            id: s.id,
            url: s.target_url,
            event: s.event_type,
            is_active: s.is_active,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// List all subscriptions.
/// GET /subscriptions
pub async fn list_subscriptions(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<SubscriptionSummary>>> {
    let subscriptions = state.runtime().registry().list().await?;
    Ok(Json(
        subscriptions
            .into_iter()
            .map(SubscriptionSummary::from)
            .collect(),
    ))
}

/// Register a subscription.
/// POST /add_subscription
pub async fn add_subscription(
    State(state): State<AppState>,
    Json(request): Json<AddSubscriptionRequest>,
) -> ApiResult<(StatusCode, Json<AddSubscriptionResponse>)> {
    let (Some(target_url), Some(event_type)) = (request.target_url, request.event_type) else {
        return Err(ApiError::validation(
            "Missing required fields: target_url, event_type",
        ));
    };

    let mut subscription = Subscription::new(target_url, event_type);
    if let Some(secret) = request.secret_key {
        subscription = subscription.with_secret(secret);
    }

    let created = state.runtime().registry().create(subscription).await?;
    Ok((
        StatusCode::CREATED,
        Json(AddSubscriptionResponse { id: created.id }),
    ))
}

/// Partially update a subscription.
/// PUT /update_subscription/:id
pub async fn update_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<SubscriptionUpdate>,
) -> ApiResult<Json<MessageResponse>> {
    state.runtime().registry().update(&id, &update).await?;
    Ok(Json(MessageResponse {
        message: "Subscription updated".to_string(),
    }))
}

/// Delete a subscription. Pending retries for it are cancelled.
/// DELETE /delete_subscription/:id
pub async fn delete_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    state.runtime().registry().delete(&id).await?;
    Ok(Json(MessageResponse {
        message: "Subscription deleted".to_string(),
    }))
}
