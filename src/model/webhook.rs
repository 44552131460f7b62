//! Inbound webhook events and payment records

use super::{InvoiceId, Provider, WebhookEventId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Processing status of an inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Pending,
    Processed,
    Failed,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Pending => "pending",
            WebhookStatus::Processed => "processed",
            WebhookStatus::Failed => "failed",
        }
    }
}

/// A buffered provider event awaiting idempotent application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Idempotency key: derived from the provider's own event ID, so
    /// at-least-once redelivery maps onto the same record
    pub id: WebhookEventId,

    pub provider: Provider,

    /// Raw payload as received; parsed at application time
    pub payload: serde_json::Value,

    pub received_at: DateTime<Utc>,

    pub status: WebhookStatus,

    /// Processing attempts so far
    pub attempts: u32,

    /// Earliest time a failed event may be retried
    pub eligible_at: DateTime<Utc>,

    /// Last processing error, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl WebhookEvent {
    pub fn new(
        id: WebhookEventId,
        provider: Provider,
        payload: serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            provider,
            payload,
            received_at,
            status: WebhookStatus::Pending,
            attempts: 0,
            eligible_at: received_at,
            last_error: None,
        }
    }
}

/// Parsed payment notification
///
/// The one event shape this layer applies locally: "provider X received a
/// payment against external document Y". Providers wrap it differently on
/// the wire; the consumer normalizes to this before touching local state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentNotice {
    /// Provider's event ID (idempotency key source)
    pub event_id: String,

    /// External document the payment applies to
    pub external_invoice_id: String,

    /// Provider's payment identifier
    pub payment_id: String,

    /// Amount in minor currency units
    pub amount_cents: i64,
}

impl PaymentNotice {
    /// Parse a raw webhook payload into a payment notice
    ///
    /// Payload shape (both supported providers normalize to this envelope):
    /// `{"event_id": "...", "type": "payment.received",
    ///   "invoice_external_id": "...", "payment_id": "...", "amount_cents": N}`
    pub fn from_payload(payload: &serde_json::Value) -> crate::Result<Self> {
        let event_type = payload
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| crate::SyncError::InvalidWebhook("missing event type".to_string()))?;

        if event_type != "payment.received" {
            return Err(crate::SyncError::InvalidWebhook(format!(
                "unsupported event type: {}",
                event_type
            )));
        }

        let field = |name: &str| {
            payload.get(name).and_then(|v| v.as_str()).ok_or_else(|| {
                crate::SyncError::InvalidWebhook(format!("missing field: {}", name))
            })
        };

        Ok(Self {
            event_id: field("event_id")?.to_string(),
            external_invoice_id: field("invoice_external_id")?.to_string(),
            payment_id: field("payment_id")?.to_string(),
            amount_cents: payload
                .get("amount_cents")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| {
                    crate::SyncError::InvalidWebhook("missing field: amount_cents".to_string())
                })?,
        })
    }
}

/// A payment applied to a local invoice
///
/// Keyed by the webhook idempotency key: applying the same event twice
/// cannot create a second record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    /// Idempotency key of the event that created this record
    pub event_id: WebhookEventId,

    pub invoice_id: InvoiceId,

    pub provider: Provider,

    pub payment_id: String,

    pub amount_cents: i64,

    pub applied_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_payment_notice() {
        let payload = json!({
            "event_id": "evt-9",
            "type": "payment.received",
            "invoice_external_id": "qb-100",
            "payment_id": "pay-55",
            "amount_cents": 125_000,
        });

        let notice = PaymentNotice::from_payload(&payload).unwrap();
        assert_eq!(notice.event_id, "evt-9");
        assert_eq!(notice.external_invoice_id, "qb-100");
        assert_eq!(notice.amount_cents, 125_000);
    }

    #[test]
    fn test_reject_unknown_event_type() {
        let payload = json!({"event_id": "evt-9", "type": "invoice.voided"});
        assert!(PaymentNotice::from_payload(&payload).is_err());
    }

    #[test]
    fn test_reject_missing_fields() {
        let payload = json!({"type": "payment.received"});
        assert!(PaymentNotice::from_payload(&payload).is_err());
    }
}
