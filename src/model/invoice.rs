//! Invoice sync projection
//!
//! The sync layer never computes invoice totals; it carries a read-only
//! snapshot of what gets pushed to the provider plus the mutable sync state
//! the orchestrator owns.

use super::{InvoiceId, Provider};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Invoice sync status
///
/// Transitions are driven only by the orchestrator:
/// NotSynced -> Pending -> {Synced | Failed}, with Failed eligible for a
/// manual high-priority re-enqueue that restarts at Pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    NotSynced,
    Pending,
    Synced,
    Failed,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::NotSynced
    }
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::NotSynced => "not_synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

/// Read-only snapshot of the invoice data pushed to a provider
///
/// Totals come from the billing engine upstream; this layer only carries
/// them across the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceSnapshot {
    pub invoice_id: InvoiceId,

    /// Organization that owns the invoice (selects the Integration record)
    pub organization_id: String,

    /// Human-facing invoice number (e.g., "INV-2026-0147")
    pub invoice_number: String,

    /// Customer display name as it should appear on the ledger entry
    pub customer_name: String,

    /// Total in minor currency units
    pub total_cents: i64,

    /// ISO 4217 currency code
    pub currency: String,

    /// Issue date (RFC3339)
    pub issued_at: DateTime<Utc>,

    /// Free-text memo line, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

/// Mutable sync state for one invoice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceSyncState {
    pub invoice_id: InvoiceId,

    pub status: SyncStatus,

    /// Provider this invoice syncs to
    pub provider: Provider,

    /// External document ID, set on first successful sync and never
    /// overwritten afterwards
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,

    /// Last terminal error message; deferrals never land here
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl InvoiceSyncState {
    /// Fresh state for an invoice that has never synced
    pub fn new(invoice_id: InvoiceId, provider: Provider) -> Self {
        Self {
            invoice_id,
            status: SyncStatus::NotSynced,
            provider,
            external_id: None,
            last_synced_at: None,
            last_error: None,
        }
    }

    /// Apply a successful sync outcome
    ///
    /// Idempotent: the external ID recorded on first success is kept, and
    /// applying a success twice changes nothing beyond the timestamp
    /// already recorded.
    pub fn mark_synced(&mut self, external_id: String, at: DateTime<Utc>) {
        if self.external_id.is_none() {
            self.external_id = Some(external_id);
        }
        if self.status == SyncStatus::Synced {
            return;
        }
        self.status = SyncStatus::Synced;
        self.last_synced_at = Some(at);
        self.last_error = None;
    }

    /// Apply a terminal failure
    pub fn mark_failed(&mut self, error: String) {
        self.status = SyncStatus::Failed;
        self.last_error = Some(error);
    }
}

/// Answer to the status query exposed to the route layer
///
/// `provider` is absent for invoices that were never enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatusReport {
    pub invoice_id: InvoiceId,
    pub status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncStatusReport {
    /// Report for an invoice with no sync history
    pub fn not_synced(invoice_id: InvoiceId) -> Self {
        Self {
            invoice_id,
            status: SyncStatus::NotSynced,
            provider: None,
            external_id: None,
            error: None,
            last_synced_at: None,
        }
    }
}

impl From<&InvoiceSyncState> for SyncStatusReport {
    fn from(state: &InvoiceSyncState) -> Self {
        Self {
            invoice_id: state.invoice_id.clone(),
            status: state.status,
            provider: Some(state.provider),
            external_id: state.external_id.clone(),
            error: state.last_error.clone(),
            last_synced_at: state.last_synced_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> InvoiceSyncState {
        InvoiceSyncState::new(InvoiceId::new("inv-1"), Provider::QuickBooks)
    }

    #[test]
    fn test_mark_synced_sets_external_id_once() {
        let mut s = state();
        let t = Utc::now();
        s.mark_synced("qb-100".to_string(), t);
        assert_eq!(s.status, SyncStatus::Synced);
        assert_eq!(s.external_id.as_deref(), Some("qb-100"));

        // A second success never overwrites the recorded external ID
        s.mark_synced("qb-999".to_string(), Utc::now());
        assert_eq!(s.external_id.as_deref(), Some("qb-100"));
        assert_eq!(s.last_synced_at, Some(t));
    }

    #[test]
    fn test_mark_failed_keeps_external_id() {
        let mut s = state();
        s.mark_synced("qb-100".to_string(), Utc::now());
        s.mark_failed("validation rejected".to_string());
        assert_eq!(s.status, SyncStatus::Failed);
        assert_eq!(s.external_id.as_deref(), Some("qb-100"));
        assert_eq!(s.last_error.as_deref(), Some("validation rejected"));
    }
}
