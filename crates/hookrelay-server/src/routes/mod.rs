//! Route definitions for the REST API.

mod deliveries;
mod health;
mod ingest;
mod subscriptions;

use axum::{
    routing::{delete, get, post, put},
    Router,
};

use crate::state::AppState;

/// Create the main application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Ingestion
        .route("/ingest/:subscription_id", post(ingest::ingest_event))
        // Delivery status
        .route(
            "/subscription_deliveries/:subscription_id",
            get(deliveries::subscription_deliveries),
        )
        .route("/delivery_status/:event_id", get(deliveries::delivery_status))
        // Subscription management
        .route("/subscriptions", get(subscriptions::list_subscriptions))
        .route("/add_subscription", post(subscriptions::add_subscription))
        .route(
            "/update_subscription/:id",
            put(subscriptions::update_subscription),
        )
        .route(
            "/delete_subscription/:id",
            delete(subscriptions::delete_subscription),
        )
        // Attach state
        .with_state(state)
}

pub use deliveries::*;
pub use health::*;
pub use ingest::*;
pub use subscriptions::*;
