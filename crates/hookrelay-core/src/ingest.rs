//! Inbound event acceptance.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{RelayError, RelayResult};
use crate::queue::DispatchQueue;
use crate::registry::SubscriptionRegistry;
use crate::signature;
use crate::store::EventStore;
use crate::types::{DeliveryJob, Event, IngestBody};

/// Authenticates inbound events, stores them and queues delivery.
pub struct IngestService {
    registry: Arc<SubscriptionRegistry>,
    events: Arc<dyn EventStore>,
    queue: Arc<DispatchQueue>,
}

impl IngestService {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        events: Arc<dyn EventStore>,
        queue: Arc<DispatchQueue>,
    ) -> Self {
        Self {
            registry,
            events,
            queue,
        }
    }

    /// Accept a raw request body for a subscription.
    ///
    /// Checks run in order: subscription exists, body is JSON, signature
    /// verifies, body has the `{event, data}` shape, subscription is active,
    /// event type passes the filter. Nothing is stored unless all pass.
    pub async fn ingest(
        &self,
        subscription_id: &str,
        body: &[u8],
        signature_header: Option<&str>,
    ) -> RelayResult<Event> {
        let subscription = self.registry.require(subscription_id).await?;

        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| RelayError::validation(format!("Body is not valid JSON: {}", e)))?;

        if let Err(e) =
            signature::verify_for_subscription(&subscription, &payload, signature_header)
        {
            warn!(subscription_id = %subscription_id, error = %e, "Rejected inbound event");
            return Err(e);
        }

        let parsed: IngestBody = serde_json::from_value(payload.clone()).map_err(|e| {
            RelayError::validation(format!("Body must be {{\"event\": string, \"data\": object}}: {}", e))
        })?;

        if !subscription.is_active {
            return Err(RelayError::Inactive {
                subscription_id: subscription.id,
            });
        }
        if !subscription.accepts(&parsed.event) {
            return Err(RelayError::event_type_rejected(
                &parsed.event,
                &subscription.event_type,
            ));
        }

        // Hold queue capacity first so a rejected request stores nothing.
        let slot = self.queue.try_reserve().map_err(|e| {
            warn!(
                subscription_id = %subscription.id,
                error = %e,
                "Dispatch queue unavailable, rejecting event"
            );
            e
        })?;
        let event = self.events.append(&parsed.event, payload)?;
        slot.send(DeliveryJob::new(&subscription.id, &event.id));

        info!(
            subscription_id = %subscription.id,
            event_id = %event.id,
            event_type = %event.event_type,
            "Event accepted"
        );
        debug!(queue_depth = self.queue.depth(), "Dispatch queue depth");
        Ok(event)
    }
}
