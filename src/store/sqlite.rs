//! SQLite implementation of the Store trait
//!
//! WAL mode for concurrent reads; the connection itself is mutex-guarded
//! since every operation is a short indexed statement.

use super::Store;
use crate::model::{
    AuditAction, AuditLogEntry, ConnectionStatus, Integration, InvoiceId, InvoiceSnapshot,
    InvoiceSyncState, JobId, PaymentRecord, Priority, Provider, SyncJob, SyncStatus,
    WebhookEvent, WebhookEventId, WebhookStatus,
};
use crate::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// SQLite-backed store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Opening sync database");

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory database (tests)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS invoice_snapshots (
                invoice_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS invoice_sync_state (
                invoice_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                provider TEXT NOT NULL,
                external_id TEXT,
                last_synced_at TEXT,
                last_error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_sync_state_external
                ON invoice_sync_state(provider, external_id);

            CREATE TABLE IF NOT EXISTS integrations (
                organization_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                status TEXT NOT NULL,
                token_expires_at TEXT,
                last_synced_at TEXT,
                last_error TEXT,
                PRIMARY KEY (organization_id, provider)
            );

            CREATE TABLE IF NOT EXISTS sync_jobs (
                id TEXT PRIMARY KEY,
                invoice_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                priority TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                eligible_at TEXT NOT NULL,
                enqueued_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS webhook_events (
                id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                payload TEXT NOT NULL,
                received_at TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                eligible_at TEXT NOT NULL,
                last_error TEXT
            );

            CREATE TABLE IF NOT EXISTS payments (
                event_id TEXT PRIMARY KEY,
                invoice_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                payment_id TEXT NOT NULL,
                amount_cents INTEGER NOT NULL,
                applied_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_payments_invoice
                ON payments(invoice_id);

            CREATE TABLE IF NOT EXISTS audit_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                invoice_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                action TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                detail TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_audit_invoice
                ON audit_log(invoice_id);
            "#,
        )?;
        Ok(())
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| crate::SyncError::Storage(format!("bad timestamp {:?}: {}", s, e)))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_ts(&v)).transpose()
}

fn parse_provider(s: &str) -> Result<Provider> {
    s.parse()
}

fn parse_sync_status(s: &str) -> Result<SyncStatus> {
    match s {
        "not_synced" => Ok(SyncStatus::NotSynced),
        "pending" => Ok(SyncStatus::Pending),
        "synced" => Ok(SyncStatus::Synced),
        "failed" => Ok(SyncStatus::Failed),
        other => Err(crate::SyncError::Storage(format!(
            "bad sync status: {}",
            other
        ))),
    }
}

fn parse_connection_status(s: &str) -> Result<ConnectionStatus> {
    match s {
        "disconnected" => Ok(ConnectionStatus::Disconnected),
        "connected" => Ok(ConnectionStatus::Connected),
        "error" => Ok(ConnectionStatus::Error),
        other => Err(crate::SyncError::Storage(format!(
            "bad connection status: {}",
            other
        ))),
    }
}

fn parse_priority(s: &str) -> Result<Priority> {
    match s {
        "high" => Ok(Priority::High),
        "normal" => Ok(Priority::Normal),
        other => Err(crate::SyncError::Storage(format!("bad priority: {}", other))),
    }
}

fn parse_webhook_status(s: &str) -> Result<WebhookStatus> {
    match s {
        "pending" => Ok(WebhookStatus::Pending),
        "processed" => Ok(WebhookStatus::Processed),
        "failed" => Ok(WebhookStatus::Failed),
        other => Err(crate::SyncError::Storage(format!(
            "bad webhook status: {}",
            other
        ))),
    }
}

fn parse_action(s: &str) -> Result<AuditAction> {
    match s {
        "initiated" => Ok(AuditAction::Initiated),
        "succeeded" => Ok(AuditAction::Succeeded),
        "failed" => Ok(AuditAction::Failed),
        "retried" => Ok(AuditAction::Retried),
        "deferred_circuit_open" => Ok(AuditAction::DeferredCircuitOpen),
        "deferred_rate_limited" => Ok(AuditAction::DeferredRateLimited),
        "webhook_applied" => Ok(AuditAction::WebhookApplied),
        "webhook_duplicate" => Ok(AuditAction::WebhookDuplicate),
        "webhook_failed" => Ok(AuditAction::WebhookFailed),
        other => Err(crate::SyncError::Storage(format!("bad action: {}", other))),
    }
}

impl Store for SqliteStore {
    fn upsert_snapshot(&self, snapshot: &InvoiceSnapshot) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO invoice_snapshots (invoice_id, payload) VALUES (?1, ?2)",
            params![
                snapshot.invoice_id.as_str(),
                serde_json::to_string(snapshot)?
            ],
        )?;
        Ok(())
    }

    fn get_snapshot(&self, invoice_id: &InvoiceId) -> Result<Option<InvoiceSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM invoice_snapshots WHERE invoice_id = ?1",
                params![invoice_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|p| serde_json::from_str(&p).map_err(Into::into))
            .transpose()
    }

    fn get_sync_state(&self, invoice_id: &InvoiceId) -> Result<Option<InvoiceSyncState>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT status, provider, external_id, last_synced_at, last_error
                 FROM invoice_sync_state WHERE invoice_id = ?1",
                params![invoice_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(status, provider, external_id, last_synced_at, last_error)| {
            Ok(InvoiceSyncState {
                invoice_id: invoice_id.clone(),
                status: parse_sync_status(&status)?,
                provider: parse_provider(&provider)?,
                external_id,
                last_synced_at: parse_opt_ts(last_synced_at)?,
                last_error,
            })
        })
        .transpose()
    }

    fn put_sync_state(&self, state: &InvoiceSyncState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO invoice_sync_state
             (invoice_id, status, provider, external_id, last_synced_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                state.invoice_id.as_str(),
                state.status.as_str(),
                state.provider.code(),
                state.external_id,
                state.last_synced_at.map(|t| t.to_rfc3339()),
                state.last_error,
            ],
        )?;
        Ok(())
    }

    fn find_by_external_id(
        &self,
        provider: Provider,
        external_id: &str,
    ) -> Result<Option<InvoiceId>> {
        let conn = self.conn.lock().unwrap();
        let id: Option<String> = conn
            .query_row(
                "SELECT invoice_id FROM invoice_sync_state
                 WHERE provider = ?1 AND external_id = ?2",
                params![provider.code(), external_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(InvoiceId::new))
    }

    fn get_integration(
        &self,
        organization_id: &str,
        provider: Provider,
    ) -> Result<Option<Integration>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT status, token_expires_at, last_synced_at, last_error
                 FROM integrations WHERE organization_id = ?1 AND provider = ?2",
                params![organization_id, provider.code()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(status, token_expires_at, last_synced_at, last_error)| {
            Ok(Integration {
                organization_id: organization_id.to_string(),
                provider,
                status: parse_connection_status(&status)?,
                token_expires_at: parse_opt_ts(token_expires_at)?,
                last_synced_at: parse_opt_ts(last_synced_at)?,
                last_error,
            })
        })
        .transpose()
    }

    fn upsert_integration(&self, integration: &Integration) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO integrations
             (organization_id, provider, status, token_expires_at, last_synced_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                integration.organization_id,
                integration.provider.code(),
                integration.status.as_str(),
                integration.token_expires_at.map(|t| t.to_rfc3339()),
                integration.last_synced_at.map(|t| t.to_rfc3339()),
                integration.last_error,
            ],
        )?;
        Ok(())
    }

    fn save_job(&self, job: &SyncJob) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO sync_jobs
             (id, invoice_id, provider, priority, attempts, eligible_at, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job.id.as_str(),
                job.invoice_id.as_str(),
                job.provider.code(),
                job.priority.as_str(),
                job.attempts,
                job.eligible_at.to_rfc3339(),
                job.enqueued_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn delete_job(&self, job_id: &JobId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM sync_jobs WHERE id = ?1", params![job_id.as_str()])?;
        Ok(())
    }

    fn load_jobs(&self) -> Result<Vec<SyncJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, invoice_id, provider, priority, attempts, eligible_at, enqueued_at
             FROM sync_jobs",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut jobs = Vec::new();
        for row in rows {
            let (id, invoice_id, provider, priority, attempts, eligible_at, enqueued_at) = row?;
            jobs.push(SyncJob {
                id: JobId::new(id),
                invoice_id: InvoiceId::new(invoice_id),
                provider: parse_provider(&provider)?,
                priority: parse_priority(&priority)?,
                attempts,
                eligible_at: parse_ts(&eligible_at)?,
                enqueued_at: parse_ts(&enqueued_at)?,
            });
        }
        Ok(jobs)
    }

    fn save_webhook_event(&self, event: &WebhookEvent) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO webhook_events
             (id, provider, payload, received_at, status, attempts, eligible_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.id.as_str(),
                event.provider.code(),
                serde_json::to_string(&event.payload)?,
                event.received_at.to_rfc3339(),
                event.status.as_str(),
                event.attempts,
                event.eligible_at.to_rfc3339(),
                event.last_error,
            ],
        )?;
        Ok(())
    }

    fn get_webhook_event(&self, event_id: &WebhookEventId) -> Result<Option<WebhookEvent>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT provider, payload, received_at, status, attempts, eligible_at, last_error
                 FROM webhook_events WHERE id = ?1",
                params![event_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()?;

        row.map(
            |(provider, payload, received_at, status, attempts, eligible_at, last_error)| {
                Ok(WebhookEvent {
                    id: event_id.clone(),
                    provider: parse_provider(&provider)?,
                    payload: serde_json::from_str(&payload)?,
                    received_at: parse_ts(&received_at)?,
                    status: parse_webhook_status(&status)?,
                    attempts,
                    eligible_at: parse_ts(&eligible_at)?,
                    last_error,
                })
            },
        )
        .transpose()
    }

    fn load_unprocessed_webhooks(&self, max_attempts: u32) -> Result<Vec<WebhookEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, provider, payload, received_at, status, attempts, eligible_at, last_error
             FROM webhook_events
             WHERE status = 'pending' OR (status = 'failed' AND attempts < ?1)",
        )?;
        let rows = stmt.query_map(params![max_attempts], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, provider, payload, received_at, status, attempts, eligible_at, last_error) =
                row?;
            events.push(WebhookEvent {
                id: WebhookEventId::new(id),
                provider: parse_provider(&provider)?,
                payload: serde_json::from_str(&payload)?,
                received_at: parse_ts(&received_at)?,
                status: parse_webhook_status(&status)?,
                attempts,
                eligible_at: parse_ts(&eligible_at)?,
                last_error,
            });
        }
        Ok(events)
    }

    fn insert_payment(&self, payment: &PaymentRecord) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO payments
             (event_id, invoice_id, provider, payment_id, amount_cents, applied_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                payment.event_id.as_str(),
                payment.invoice_id.as_str(),
                payment.provider.code(),
                payment.payment_id,
                payment.amount_cents,
                payment.applied_at.to_rfc3339(),
            ],
        )?;
        Ok(inserted > 0)
    }

    fn payments_for_invoice(&self, invoice_id: &InvoiceId) -> Result<Vec<PaymentRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT event_id, provider, payment_id, amount_cents, applied_at
             FROM payments WHERE invoice_id = ?1 ORDER BY applied_at",
        )?;
        let rows = stmt.query_map(params![invoice_id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut payments = Vec::new();
        for row in rows {
            let (event_id, provider, payment_id, amount_cents, applied_at) = row?;
            payments.push(PaymentRecord {
                event_id: WebhookEventId::new(event_id),
                invoice_id: invoice_id.clone(),
                provider: parse_provider(&provider)?,
                payment_id,
                amount_cents,
                applied_at: parse_ts(&applied_at)?,
            });
        }
        Ok(payments)
    }

    fn append_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO audit_log (invoice_id, provider, action, timestamp, detail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.invoice_id.as_str(),
                entry.provider.code(),
                entry.action.as_str(),
                entry.timestamp.to_rfc3339(),
                entry.detail,
            ],
        )?;
        Ok(())
    }

    fn audit_for_invoice(&self, invoice_id: &InvoiceId) -> Result<Vec<AuditLogEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT provider, action, timestamp, detail
             FROM audit_log WHERE invoice_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![invoice_id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (provider, action, timestamp, detail) = row?;
            entries.push(AuditLogEntry {
                invoice_id: invoice_id.clone(),
                provider: parse_provider(&provider)?,
                action: parse_action(&action)?,
                timestamp: parse_ts(&timestamp)?,
                detail,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AuditAction;
    use chrono::Utc;

    fn snapshot(id: &str) -> InvoiceSnapshot {
        InvoiceSnapshot {
            invoice_id: InvoiceId::new(id),
            organization_id: "org-1".to_string(),
            invoice_number: format!("INV-{}", id),
            customer_name: "Acme Restoration".to_string(),
            total_cents: 250_000,
            currency: "USD".to_string(),
            issued_at: Utc::now(),
            memo: None,
        }
    }

    #[test]
    fn test_snapshot_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_snapshot(&snapshot("inv-1")).unwrap();

        let loaded = store.get_snapshot(&InvoiceId::new("inv-1")).unwrap().unwrap();
        assert_eq!(loaded.invoice_number, "INV-inv-1");
        assert!(store.get_snapshot(&InvoiceId::new("inv-2")).unwrap().is_none());
    }

    #[test]
    fn test_sync_state_round_trip_and_external_lookup() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut state = InvoiceSyncState::new(InvoiceId::new("inv-1"), Provider::QuickBooks);
        state.mark_synced("qb-100".to_string(), Utc::now());
        store.put_sync_state(&state).unwrap();

        let loaded = store.get_sync_state(&InvoiceId::new("inv-1")).unwrap().unwrap();
        assert_eq!(loaded.status, SyncStatus::Synced);
        assert_eq!(loaded.external_id.as_deref(), Some("qb-100"));

        let found = store
            .find_by_external_id(Provider::QuickBooks, "qb-100")
            .unwrap();
        assert_eq!(found, Some(InvoiceId::new("inv-1")));
        assert!(store
            .find_by_external_id(Provider::Xero, "qb-100")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_payment_idempotent_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");

        let payment = PaymentRecord {
            event_id: WebhookEventId::derive("quickbooks", "evt-1"),
            invoice_id: InvoiceId::new("inv-1"),
            provider: Provider::QuickBooks,
            payment_id: "pay-1".to_string(),
            amount_cents: 10_000,
            applied_at: Utc::now(),
        };

        {
            let store = SqliteStore::open(&path).unwrap();
            assert!(store.insert_payment(&payment).unwrap());
        }
        {
            let store = SqliteStore::open(&path).unwrap();
            assert!(!store.insert_payment(&payment).unwrap());
        }
    }

    #[test]
    fn test_job_persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");

        let job = SyncJob::new(
            JobId::from_seq(3),
            InvoiceId::new("inv-9"),
            Provider::Xero,
            Priority::High,
            Utc::now(),
        );

        {
            let store = SqliteStore::open(&path).unwrap();
            store.save_job(&job).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let jobs = store.load_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job.id);
        assert_eq!(jobs[0].priority, Priority::High);
    }

    #[test]
    fn test_audit_ordering() {
        let store = SqliteStore::open_in_memory().unwrap();
        for action in [
            AuditAction::Initiated,
            AuditAction::Retried,
            AuditAction::Succeeded,
        ] {
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

        let entries = store.audit_for_invoice(&InvoiceId::new("inv-1")).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].action, AuditAction::Initiated);
        assert_eq!(entries[2].action, AuditAction::Succeeded);
    }
}
