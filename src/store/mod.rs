//! Persistence behind a trait
//!
//! The sync layer's durable state: invoice sync status, integrations,
//! queued jobs, webhook events, applied payments, and the audit log.
//! SQLite is the primary backend; the in-memory store exists for tests
//! and has the same semantics.
//!
//! Methods are synchronous: every call is a short, indexed operation and
//! the SQLite connection is mutex-guarded, so workers call straight
//! through without tying up the runtime.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::model::{
    AuditLogEntry, Integration, InvoiceId, InvoiceSnapshot, InvoiceSyncState, JobId,
    PaymentRecord, Provider, SyncJob, WebhookEvent, WebhookEventId,
};
use crate::Result;
use std::sync::Arc;

/// Shared store handle
pub type SharedStore = Arc<dyn Store>;

/// Persistence interface for the sync layer
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Invoice snapshots (read-mostly; written by the upstream product)
    // ------------------------------------------------------------------

    /// Insert or replace an invoice snapshot
    fn upsert_snapshot(&self, snapshot: &InvoiceSnapshot) -> Result<()>;

    /// Fetch an invoice snapshot
    fn get_snapshot(&self, invoice_id: &InvoiceId) -> Result<Option<InvoiceSnapshot>>;

    // ------------------------------------------------------------------
    // Invoice sync state (written only by the orchestrator)
    // ------------------------------------------------------------------

    /// Fetch the sync state for an invoice
    fn get_sync_state(&self, invoice_id: &InvoiceId) -> Result<Option<InvoiceSyncState>>;

    /// Insert or replace the sync state for an invoice
    fn put_sync_state(&self, state: &InvoiceSyncState) -> Result<()>;

    /// Reverse lookup: which local invoice does a provider document map to?
    fn find_by_external_id(
        &self,
        provider: Provider,
        external_id: &str,
    ) -> Result<Option<InvoiceId>>;

    // ------------------------------------------------------------------
    // Integrations (at most one per (organization, provider))
    // ------------------------------------------------------------------

    fn get_integration(
        &self,
        organization_id: &str,
        provider: Provider,
    ) -> Result<Option<Integration>>;

    fn upsert_integration(&self, integration: &Integration) -> Result<()>;

    // ------------------------------------------------------------------
    // Sync jobs (write-through durability for the in-memory queue)
    // ------------------------------------------------------------------

    /// Insert or replace a queued job
    fn save_job(&self, job: &SyncJob) -> Result<()>;

    /// Remove a job on terminal success or terminal failure
    fn delete_job(&self, job_id: &JobId) -> Result<()>;

    /// All persisted jobs, for queue recovery at startup
    fn load_jobs(&self) -> Result<Vec<SyncJob>>;

    // ------------------------------------------------------------------
    // Webhook events
    // ------------------------------------------------------------------

    /// Insert or replace a webhook event record
    fn save_webhook_event(&self, event: &WebhookEvent) -> Result<()>;

    fn get_webhook_event(&self, event_id: &WebhookEventId) -> Result<Option<WebhookEvent>>;

    /// Events that still need processing (Pending, or Failed with retry
    /// budget left), for queue recovery at startup
    fn load_unprocessed_webhooks(&self, max_attempts: u32) -> Result<Vec<WebhookEvent>>;

    // ------------------------------------------------------------------
    // Payments (idempotent application target)
    // ------------------------------------------------------------------

    /// Insert a payment record; returns false if the idempotency key was
    /// already applied (not an error)
    fn insert_payment(&self, payment: &PaymentRecord) -> Result<bool>;

    fn payments_for_invoice(&self, invoice_id: &InvoiceId) -> Result<Vec<PaymentRecord>>;

    // ------------------------------------------------------------------
    // Audit log (append-only)
    // ------------------------------------------------------------------

    fn append_audit(&self, entry: &AuditLogEntry) -> Result<()>;

    fn audit_for_invoice(&self, invoice_id: &InvoiceId) -> Result<Vec<AuditLogEntry>>;
}
