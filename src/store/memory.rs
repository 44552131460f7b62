//! In-memory implementation of the Store trait
//!
//! Primarily for tests. Same semantics as SQLite but nothing survives the
//! process. Thread-safe via RwLock.

use super::Store;
use crate::model::{
    AuditLogEntry, Integration, InvoiceId, InvoiceSnapshot, InvoiceSyncState, JobId,
    PaymentRecord, Provider, SyncJob, WebhookEvent, WebhookEventId, WebhookStatus,
};
use crate::Result;
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    snapshots: HashMap<InvoiceId, InvoiceSnapshot>,
    sync_states: HashMap<InvoiceId, InvoiceSyncState>,
    integrations: HashMap<(String, Provider), Integration>,
    jobs: HashMap<JobId, SyncJob>,
    webhooks: HashMap<WebhookEventId, WebhookEvent>,
    payments: HashMap<WebhookEventId, PaymentRecord>,
    audit: Vec<AuditLogEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total audit entries (test helper)
    pub fn audit_len(&self) -> usize {
        self.inner.read().unwrap().audit.len()
    }
}

impl Store for MemoryStore {
    fn upsert_snapshot(&self, snapshot: &InvoiceSnapshot) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .snapshots
            .insert(snapshot.invoice_id.clone(), snapshot.clone());
        Ok(())
    }

    fn get_snapshot(&self, invoice_id: &InvoiceId) -> Result<Option<InvoiceSnapshot>> {
        Ok(self.inner.read().unwrap().snapshots.get(invoice_id).cloned())
    }

    fn get_sync_state(&self, invoice_id: &InvoiceId) -> Result<Option<InvoiceSyncState>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .sync_states
            .get(invoice_id)
            .cloned())
    }

    fn put_sync_state(&self, state: &InvoiceSyncState) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner
            .sync_states
            .insert(state.invoice_id.clone(), state.clone());
        Ok(())
    }

    fn find_by_external_id(
        &self,
        provider: Provider,
        external_id: &str,
    ) -> Result<Option<InvoiceId>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .sync_states
            .values()
            .find(|s| s.provider == provider && s.external_id.as_deref() == Some(external_id))
            .map(|s| s.invoice_id.clone()))
    }

    fn get_integration(
        &self,
        organization_id: &str,
        provider: Provider,
    ) -> Result<Option<Integration>> {
        let key = (organization_id.to_string(), provider);
        Ok(self.inner.read().unwrap().integrations.get(&key).cloned())
    }

    fn upsert_integration(&self, integration: &Integration) -> Result<()> {
        let key = (integration.organization_id.clone(), integration.provider);
        self.inner
            .write()
            .unwrap()
            .integrations
            .insert(key, integration.clone());
        Ok(())
    }

    fn save_job(&self, job: &SyncJob) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .jobs
            .insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn delete_job(&self, job_id: &JobId) -> Result<()> {
        self.inner.write().unwrap().jobs.remove(job_id);
        Ok(())
    }

    fn load_jobs(&self) -> Result<Vec<SyncJob>> {
        Ok(self.inner.read().unwrap().jobs.values().cloned().collect())
    }

    fn save_webhook_event(&self, event: &WebhookEvent) -> Result<()> {
        self.inner
            .write()
            .unwrap()
            .webhooks
            .insert(event.id.clone(), event.clone());
        Ok(())
    }

    fn get_webhook_event(&self, event_id: &WebhookEventId) -> Result<Option<WebhookEvent>> {
        Ok(self.inner.read().unwrap().webhooks.get(event_id).cloned())
    }

    fn load_unprocessed_webhooks(&self, max_attempts: u32) -> Result<Vec<WebhookEvent>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .webhooks
            .values()
            .filter(|e| match e.status {
                WebhookStatus::Pending => true,
                WebhookStatus::Failed => e.attempts < max_attempts,
                WebhookStatus::Processed => false,
            })
            .cloned()
            .collect())
    }

    fn insert_payment(&self, payment: &PaymentRecord) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        if inner.payments.contains_key(&payment.event_id) {
            return Ok(false);
        }
        inner
            .payments
            .insert(payment.event_id.clone(), payment.clone());
        Ok(true)
    }

    fn payments_for_invoice(&self, invoice_id: &InvoiceId) -> Result<Vec<PaymentRecord>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .payments
            .values()
            .filter(|p| &p.invoice_id == invoice_id)
            .cloned()
            .collect())
    }

    fn append_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        self.inner.write().unwrap().audit.push(entry.clone());
        Ok(())
    }

    fn audit_for_invoice(&self, invoice_id: &InvoiceId) -> Result<Vec<AuditLogEntry>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .audit
            .iter()
            .filter(|e| &e.invoice_id == invoice_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AuditAction, Priority};
    use chrono::Utc;

    #[test]
    fn test_payment_insert_is_idempotent() {
        let store = MemoryStore::new();
        let payment = PaymentRecord {
            event_id: WebhookEventId::derive("xero", "evt-1"),
            invoice_id: InvoiceId::new("inv-1"),
            provider: Provider::Xero,
            payment_id: "pay-1".to_string(),
            amount_cents: 5_000,
            applied_at: Utc::now(),
        };

        assert!(store.insert_payment(&payment).unwrap());
        assert!(!store.insert_payment(&payment).unwrap());
        assert_eq!(
            store
                .payments_for_invoice(&InvoiceId::new("inv-1"))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_job_round_trip() {
        let store = MemoryStore::new();
        let job = SyncJob::new(
            JobId::from_seq(1),
            InvoiceId::new("inv-1"),
            Provider::QuickBooks,
            Priority::Normal,
            Utc::now(),
        );
        store.save_job(&job).unwrap();
        assert_eq!(store.load_jobs().unwrap().len(), 1);
        store.delete_job(&job.id).unwrap();
        assert!(store.load_jobs().unwrap().is_empty());
    }

    #[test]
    fn test_audit_is_append_only_per_invoice() {
        let store = MemoryStore::new();
        for action in [AuditAction::Initiated, AuditAction::Succeeded] {
            store
                .append_audit(&AuditLogEntry::new(
                    InvoiceId::new("inv-1"),
                    Provider::QuickBooks,
                    action,
                    Utc::now(),
                    None,
                ))
                .unwrap();
        }
        assert_eq!(
            store
                .audit_for_invoice(&InvoiceId::new("inv-1"))
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_unprocessed_webhooks_respect_attempt_cap() {
        let store = MemoryStore::new();
        let mut event = WebhookEvent::new(
            WebhookEventId::derive("xero", "evt-2"),
            Provider::Xero,
            serde_json::json!({}),
            Utc::now(),
        );
        event.status = WebhookStatus::Failed;
        event.attempts = 5;
        store.save_webhook_event(&event).unwrap();

        assert!(store.load_unprocessed_webhooks(5).unwrap().is_empty());
        assert_eq!(store.load_unprocessed_webhooks(6).unwrap().len(), 1);
    }
}
