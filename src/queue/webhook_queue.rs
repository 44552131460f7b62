//! Webhook ingestion queue
//!
//! Buffers inbound provider events for asynchronous, idempotent
//! processing, decoupled from the HTTP handler that receives them. The
//! handler replies 2xx as soon as an event is durably queued; providers
//! retry on anything else, so enqueue persists before acknowledging.

use crate::clock::SharedClock;
use crate::metrics;
use crate::model::{Provider, WebhookEvent, WebhookEventId, WebhookStatus};
use crate::store::SharedStore;
use crate::Result;
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Bounded inbound event buffer
pub struct WebhookQueue {
    inner: Mutex<HashMap<WebhookEventId, WebhookEvent>>,
    store: SharedStore,
    clock: SharedClock,
    capacity: usize,
    max_attempts: u32,
    retry_delay: std::time::Duration,
}

impl WebhookQueue {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        capacity: usize,
        max_attempts: u32,
        retry_delay: std::time::Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            store,
            clock,
            capacity,
            max_attempts,
            retry_delay,
        }
    }

    /// Reload unprocessed events after a restart
    pub fn recover(&self) -> Result<usize> {
        let events = self.store.load_unprocessed_webhooks(self.max_attempts)?;
        let mut inner = self.inner.lock().unwrap();
        for event in events {
            inner.insert(event.id.clone(), event);
        }
        let recovered = inner.len();
        drop(inner);
        self.publish_gauges();
        Ok(recovered)
    }

    /// Accept a provider event
    ///
    /// The idempotency key is derived from the payload's `event_id`;
    /// redelivery of an already-known event returns the existing ID
    /// without queuing a second copy. Fails with `WebhookQueueFull` when
    /// the buffer is at capacity so the endpoint can answer 5xx and let
    /// the provider's own retry take over.
    pub fn enqueue(
        &self,
        provider: Provider,
        payload: serde_json::Value,
    ) -> Result<WebhookEventId> {
        let provider_event_id = payload
            .get("event_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| crate::SyncError::InvalidWebhook("missing event_id".to_string()))?;

        let id = WebhookEventId::derive(provider.code(), provider_event_id);

        let mut inner = self.inner.lock().unwrap();

        // Already buffered: acknowledge the redelivery without a second
        // copy. Redelivery of an already-processed event re-queues; the
        // consumer's idempotency-key check turns it into a recorded no-op.
        if inner.contains_key(&id) {
            debug!(event = %id, "Webhook event already queued, acknowledging redelivery");
            return Ok(id);
        }

        if inner.len() >= self.capacity {
            warn!(capacity = self.capacity, "Webhook queue at capacity, rejecting event");
            return Err(crate::SyncError::WebhookQueueFull {
                capacity: self.capacity,
            });
        }

        let event = WebhookEvent::new(id.clone(), provider, payload, self.clock.now());
        self.store.save_webhook_event(&event)?;
        inner.insert(id.clone(), event);
        drop(inner);

        metrics::record_webhook_received(provider.code());
        self.publish_gauges();
        Ok(id)
    }

    /// Pull the next eligible event, if any (FIFO by receipt time)
    pub fn dequeue(&self) -> Option<WebhookEvent> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();

        let id = inner
            .values()
            .filter(|event| event.eligible_at <= now)
            .min_by_key(|event| event.received_at)
            .map(|event| event.id.clone())?;

        let event = inner.remove(&id);
        drop(inner);

        self.publish_gauges();
        event
    }

    /// Record successful application
    pub fn mark_processed(&self, mut event: WebhookEvent) -> Result<()> {
        event.status = WebhookStatus::Processed;
        event.attempts += 1;
        event.last_error = None;
        self.store.save_webhook_event(&event)?;
        metrics::record_webhook_outcome(event.provider.code(), "processed");
        Ok(())
    }

    /// Record a processing failure
    ///
    /// Schedules a retry on the webhook schedule until the attempt cap is
    /// reached; after that the event stays Failed and needs manual
    /// intervention.
    pub fn mark_failed(&self, mut event: WebhookEvent, error: String) -> Result<()> {
        event.status = WebhookStatus::Failed;
        event.attempts += 1;
        event.last_error = Some(error.clone());

        if event.attempts < self.max_attempts {
            event.eligible_at = self.clock.now()
                + Duration::from_std(self.retry_delay).unwrap_or_else(|_| Duration::seconds(30));
            self.store.save_webhook_event(&event)?;

            debug!(
                event = %event.id,
                attempts = event.attempts,
                "Webhook processing failed, scheduled retry"
            );

            metrics::record_webhook_outcome(event.provider.code(), "retried");

            let mut inner = self.inner.lock().unwrap();
            inner.insert(event.id.clone(), event);
        } else {
            self.store.save_webhook_event(&event)?;
            warn!(
                event = %event.id,
                attempts = event.attempts,
                error = %error,
                "Webhook event exhausted retries, manual intervention required"
            );
            metrics::record_webhook_outcome(event.provider.code(), "exhausted");
        }

        self.publish_gauges();
        Ok(())
    }

    /// Drop an event that can never be applied (malformed payload)
    ///
    /// Marked Failed immediately with no retry schedule; retrying cannot
    /// fix a payload.
    pub fn discard(&self, mut event: WebhookEvent, error: String) -> Result<()> {
        event.status = WebhookStatus::Failed;
        event.attempts = self.max_attempts;
        event.last_error = Some(error.clone());
        self.store.save_webhook_event(&event)?;
        warn!(event = %event.id, error = %error, "Discarded unprocessable webhook event");
        metrics::record_webhook_outcome(event.provider.code(), "discarded");
        self.publish_gauges();
        Ok(())
    }

    /// Number of buffered events
    pub fn depth(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    fn publish_gauges(&self) {
        metrics::set_webhook_queue_depth(self.depth() as i64);
    }
}
