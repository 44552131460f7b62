//! Type-safe ID wrappers for invoices, sync jobs and webhook events

use serde::{Deserialize, Serialize};
use std::fmt;

/// Type-safe wrapper for invoice IDs
///
/// Prevents mixing up invoice IDs with job or event IDs at compile time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceId(String);

impl InvoiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for InvoiceId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for InvoiceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Type-safe wrapper for sync job IDs
///
/// Format: sequence-based (e.g., "sj-17"). Assigned by the sync queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build a job ID from the queue's monotonic sequence counter
    pub fn from_seq(seq: u64) -> Self {
        Self(format!("sj-{}", seq))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Type-safe wrapper for webhook event IDs
///
/// The event ID doubles as the idempotency key: it is derived from the
/// provider's own event identifier (`{provider}:{provider_event_id}`), so
/// redelivery of the same provider event maps to the same ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebhookEventId(String);

impl WebhookEventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the idempotency key from a provider code and provider event ID
    pub fn derive(provider_code: &str, provider_event_id: &str) -> Self {
        Self(format!("{}:{}", provider_code, provider_event_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WebhookEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoice_id_creation() {
        let id = InvoiceId::new("inv-1042");
        assert_eq!(id.as_str(), "inv-1042");
        assert_eq!(format!("{}", id), "inv-1042");
    }

    #[test]
    fn test_job_id_from_seq() {
        assert_eq!(JobId::from_seq(17).as_str(), "sj-17");
    }

    #[test]
    fn test_webhook_event_id_derivation_is_stable() {
        let a = WebhookEventId::derive("quickbooks", "evt-991");
        let b = WebhookEventId::derive("quickbooks", "evt-991");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "quickbooks:evt-991");
    }

    #[test]
    fn test_type_safety() {
        fn takes_invoice(_id: &InvoiceId) {}
        fn takes_job(_id: &JobId) {}

        takes_invoice(&InvoiceId::new("inv-1"));
        takes_job(&JobId::from_seq(1));
    }
}
