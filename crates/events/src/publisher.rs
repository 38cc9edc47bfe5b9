use crate::hub::EventHub;
use crate::webhook::WebhookPublisher;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;
use wagate_core::event::{Event, EventSink};
use wagate_core::metrics::MetricsStore;
use wagate_core::repos::EventRepository;

/// Fan-out entry point. One publish touches three independent failure
/// domains: the durable log (best-effort write), the WS hub (non-blocking
/// broadcast) and the webhook publisher (own task with its own retries).
/// None of them can fail the caller.
pub struct EventPublisher {
    log: Arc<dyn EventRepository>,
    hub: Arc<EventHub>,
    webhooks: Arc<WebhookPublisher>,
    metrics: Arc<MetricsStore>,
}

impl EventPublisher {
    pub fn new(
        log: Arc<dyn EventRepository>,
        hub: Arc<EventHub>,
        webhooks: Arc<WebhookPublisher>,
        metrics: Arc<MetricsStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            log,
            hub,
            webhooks,
            metrics,
        })
    }

    async fn fan_out(&self, event: Event, persist: bool) {
        self.metrics.inc_events_published();
        if persist {
            if let Err(e) = self.log.create(&event).await {
                warn!(event_id = %event.id, error = %e, "event not persisted to log");
            }
        }
        self.hub.broadcast(&event);
        self.webhooks.dispatch(&event);
    }

    /// Re-publication path used by replay: fans out without writing the
    /// event back into the log.
    pub async fn publish_replayed(&self, event: Event) {
        self.fan_out(event, false).await;
    }
}

#[async_trait]
impl EventSink for EventPublisher {
    async fn publish(&self, event: Event) {
        self.fan_out(event, true).await;
    }
}
