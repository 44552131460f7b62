//! The sync service: enqueue API, status query, and per-job execution
//!
//! One instance is shared by the HTTP surface and every worker in the
//! daemon's pools. Each job is processed start-to-finish by one worker;
//! the invoice's Pending status is the at-most-one-in-flight claim,
//! checked at enqueue time.

use crate::breaker::{BreakerDecision, BreakerRegistry, BreakerSnapshot};
use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::limiter::{Admission, RateLimiterRegistry};
use crate::metrics;
use crate::model::{
    AuditAction, AuditLogEntry, Integration, InvoiceId, InvoiceSyncState, JobId, PaymentNotice,
    PaymentRecord, Priority, Provider, SyncJob, SyncStatus, SyncStatusReport, WebhookEvent,
    WebhookEventId,
};
use crate::provider::{ProviderError, ProviderRegistry};
use crate::queue::{SyncQueue, WebhookQueue};
use crate::store::SharedStore;
use crate::Result;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why a job was deferred rather than attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferralReason {
    CircuitOpen,
    RateLimited,
}

/// Outcome of processing one dequeued job
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Synced {
        invoice_id: InvoiceId,
        provider: Provider,
        external_id: String,
    },
    Retried {
        invoice_id: InvoiceId,
        provider: Provider,
        attempts: u32,
        delay: Duration,
    },
    Failed {
        invoice_id: InvoiceId,
        provider: Provider,
        error: String,
    },
    Deferred {
        invoice_id: InvoiceId,
        provider: Provider,
        reason: DeferralReason,
        delay: Duration,
    },
}

/// Outcome of processing one webhook event
#[derive(Debug, Clone)]
pub enum WebhookOutcome {
    Applied {
        invoice_id: InvoiceId,
        provider: Provider,
    },
    /// Recorded no-op: the idempotency key was already applied
    Duplicate {
        event_id: WebhookEventId,
    },
    Failed {
        event_id: WebhookEventId,
        error: String,
    },
    /// Unprocessable payload, dropped without retry
    Discarded {
        event_id: WebhookEventId,
    },
}

/// The coordinating state machine for invoice sync
pub struct SyncService {
    config: SyncConfig,
    store: SharedStore,
    clock: SharedClock,
    sync_queue: SyncQueue,
    webhook_queue: WebhookQueue,
    breakers: BreakerRegistry,
    limiters: RateLimiterRegistry,
    providers: ProviderRegistry,
}

impl SyncService {
    pub fn new(
        config: SyncConfig,
        store: SharedStore,
        providers: ProviderRegistry,
        clock: SharedClock,
    ) -> Self {
        let quotas = Provider::ALL
            .iter()
            .map(|&p| (p, config.quota(p)))
            .collect();

        let sync_queue = SyncQueue::new(store.clone(), clock.clone());
        let webhook_queue = WebhookQueue::new(
            store.clone(),
            clock.clone(),
            config.webhook.capacity,
            config.webhook.max_attempts,
            Duration::from_millis(config.webhook.retry_delay_ms),
        );
        let breakers = BreakerRegistry::new(config.breaker.clone(), clock.clone());
        let limiters = RateLimiterRegistry::new(quotas, clock.clone());

        Self {
            config,
            store,
            clock,
            sync_queue,
            webhook_queue,
            breakers,
            limiters,
            providers,
        }
    }

    /// Reload persisted queue state after a restart
    pub fn recover(&self) -> Result<()> {
        let jobs = self.sync_queue.recover()?;
        let events = self.webhook_queue.recover()?;
        if jobs > 0 || events > 0 {
            info!(jobs, events, "Recovered persisted queue state");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Enqueue API and status query (consumed by the route layer)
    // ------------------------------------------------------------------

    /// Enqueue a sync for an invoice
    ///
    /// Fails with `AlreadySyncing` while a sync is pending for the same
    /// (invoice, provider) pair - the at-most-one-concurrent-sync-per-
    /// invoice guarantee.
    pub fn enqueue_sync(
        &self,
        invoice_id: InvoiceId,
        provider: Provider,
        priority: Priority,
    ) -> Result<JobId> {
        if !self.providers.is_configured(provider) {
            return Err(crate::SyncError::UnknownProvider(format!(
                "{} is not configured",
                provider
            )));
        }

        let snapshot = self
            .store
            .get_snapshot(&invoice_id)?
            .ok_or_else(|| crate::SyncError::InvoiceNotFound(invoice_id.to_string()))?;

        // Pending means claimed: a pending invoice never takes a second
        // concurrent job, for its own provider or any other
        let mut state = match self.store.get_sync_state(&invoice_id)? {
            Some(state) => {
                if state.status == SyncStatus::Pending {
                    return Err(crate::SyncError::AlreadySyncing {
                        invoice_id: invoice_id.to_string(),
                        provider: state.provider.to_string(),
                    });
                }
                // A synced document is terminal for this invoice; a new
                // variation gets its own invoice record upstream
                if state.status == SyncStatus::Synced {
                    return Err(crate::SyncError::AlreadySynced {
                        invoice_id: invoice_id.to_string(),
                        external_id: state.external_id.clone().unwrap_or_default(),
                    });
                }
                state
            }
            None => InvoiceSyncState::new(invoice_id.clone(), provider),
        };

        state.status = SyncStatus::Pending;
        state.provider = provider;
        self.store.put_sync_state(&state)?;

        let job_id = self.sync_queue.enqueue(invoice_id.clone(), provider, priority)?;

        self.audit(
            &invoice_id,
            provider,
            AuditAction::Initiated,
            Some(format!("priority {}", priority.as_str())),
        )?;

        debug!(
            invoice = %invoice_id,
            provider = %provider,
            job = %job_id,
            organization = %snapshot.organization_id,
            "Sync enqueued"
        );
        Ok(job_id)
    }

    /// Current sync status of an invoice
    pub fn sync_status(&self, invoice_id: &InvoiceId) -> Result<SyncStatusReport> {
        if let Some(state) = self.store.get_sync_state(invoice_id)? {
            return Ok(SyncStatusReport::from(&state));
        }
        // Known invoice with no sync history yet
        if self.store.get_snapshot(invoice_id)?.is_some() {
            return Ok(SyncStatusReport::not_synced(invoice_id.clone()));
        }
        Err(crate::SyncError::InvoiceNotFound(invoice_id.to_string()))
    }

    /// Accept an inbound webhook payload
    pub fn ingest_webhook(
        &self,
        provider: Provider,
        payload: serde_json::Value,
    ) -> Result<WebhookEventId> {
        self.webhook_queue.enqueue(provider, payload)
    }

    // ------------------------------------------------------------------
    // Job execution (called by sync workers)
    // ------------------------------------------------------------------

    /// Pull and process the next eligible job
    ///
    /// Returns `None` when the queue has no eligible job (workers sleep
    /// and poll again).
    pub async fn process_next_job(&self) -> Result<Option<JobOutcome>> {
        let job = match self.sync_queue.dequeue() {
            Some(job) => job,
            None => return Ok(None),
        };
        self.execute_job(job).await.map(Some)
    }

    async fn execute_job(&self, job: SyncJob) -> Result<JobOutcome> {
        let invoice_id = job.invoice_id.clone();
        let provider = job.provider;

        // Gate 1: circuit breaker (fail fast while the provider is down)
        if let BreakerDecision::Reject { retry_after } = self.breakers.check(provider) {
            self.audit(
                &invoice_id,
                provider,
                AuditAction::DeferredCircuitOpen,
                Some("deferred: circuit open".to_string()),
            )?;
            metrics::record_sync_outcome(provider.code(), "deferred_circuit_open");
            self.sync_queue.requeue_deferred(job, retry_after)?;
            return Ok(JobOutcome::Deferred {
                invoice_id,
                provider,
                reason: DeferralReason::CircuitOpen,
                delay: retry_after,
            });
        }

        // Gate 2: rate limiter (throttle healthy traffic to quota)
        if let Admission::Denied { retry_after } = self.limiters.try_acquire(provider) {
            // An admitted probe that never calls out must not stay in flight
            self.breakers.release_probe(provider);
            self.audit(
                &invoice_id,
                provider,
                AuditAction::DeferredRateLimited,
                Some("deferred: rate limited".to_string()),
            )?;
            metrics::record_sync_outcome(provider.code(), "deferred_rate_limited");
            self.sync_queue.requeue_deferred(job, retry_after)?;
            return Ok(JobOutcome::Deferred {
                invoice_id,
                provider,
                reason: DeferralReason::RateLimited,
                delay: retry_after,
            });
        }

        let client = match self.providers.get(provider) {
            Some(client) => client,
            None => {
                // Configuration changed under a queued job
                return self.handle_terminal_failure(
                    job,
                    format!("{} is no longer configured", provider),
                    None,
                );
            }
        };

        let snapshot = match self.store.get_snapshot(&invoice_id)? {
            Some(snapshot) => snapshot,
            None => {
                return self.handle_terminal_failure(
                    job,
                    "invoice snapshot missing".to_string(),
                    None,
                );
            }
        };

        let start = std::time::Instant::now();
        let result = client.sync_invoice(&snapshot).await;
        metrics::record_sync_duration(provider.code(), start.elapsed().as_secs_f64());

        match result {
            Ok(receipt) => {
                self.breakers.record_success(provider);

                let mut state = self
                    .store
                    .get_sync_state(&invoice_id)?
                    .unwrap_or_else(|| InvoiceSyncState::new(invoice_id.clone(), provider));
                state.mark_synced(receipt.external_id.clone(), self.clock.now());
                self.store.put_sync_state(&state)?;

                self.touch_integration(&snapshot.organization_id, provider, |integration| {
                    integration.record_success(self.clock.now());
                })?;

                self.sync_queue.complete(&job)?;
                self.audit(
                    &invoice_id,
                    provider,
                    AuditAction::Succeeded,
                    Some(format!("external id {}", receipt.external_id)),
                )?;
                metrics::record_sync_outcome(provider.code(), "succeeded");

                info!(
                    invoice = %invoice_id,
                    provider = %provider,
                    external_id = %receipt.external_id,
                    "Invoice synced"
                );

                // First-success external ID wins; report what is stored
                let external_id = state
                    .external_id
                    .unwrap_or(receipt.external_id);
                Ok(JobOutcome::Synced {
                    invoice_id,
                    provider,
                    external_id,
                })
            }
            Err(ProviderError::Transient(message)) => {
                // Dependency-health signal: count it against the breaker
                self.breakers.record_failure(provider);

                if job.attempts < self.config.retry.max_retries {
                    let delay = self.config.retry.backoff_delay(job.attempts);
                    let attempts = job.attempts + 1;
                    self.audit(
                        &invoice_id,
                        provider,
                        AuditAction::Retried,
                        Some(format!("attempt {}: {}", attempts, message)),
                    )?;
                    metrics::record_sync_outcome(provider.code(), "retried");
                    self.sync_queue.requeue_retry(job, delay)?;

                    debug!(
                        invoice = %invoice_id,
                        provider = %provider,
                        attempts,
                        delay_secs = delay.as_secs_f64(),
                        "Transient failure, retrying with backoff"
                    );
                    Ok(JobOutcome::Retried {
                        invoice_id,
                        provider,
                        attempts,
                        delay,
                    })
                } else {
                    let error = format!("retries exhausted: {}", message);
                    self.handle_terminal_failure(job, error, Some(&snapshot.organization_id))
                }
            }
            Err(ProviderError::Permanent(message)) => {
                // Not a dependency-health signal: breaker untouched
                self.handle_terminal_failure(job, message, Some(&snapshot.organization_id))
            }
            Err(ProviderError::AuthExpired(message)) => {
                self.touch_integration(&snapshot.organization_id, provider, |integration| {
                    integration.mark_auth_expired(message.clone());
                })?;
                self.handle_terminal_failure(job, message, None)
            }
        }
    }

    /// Mark the invoice Failed, surface the error, drop the job
    fn handle_terminal_failure(
        &self,
        job: SyncJob,
        error: String,
        organization_id: Option<&str>,
    ) -> Result<JobOutcome> {
        let invoice_id = job.invoice_id.clone();
        let provider = job.provider;

        // Terminal failures that did not report a breaker outcome
        // (permanent, auth-expired, missing snapshot) must not leave a
        // half-open probe dangling
        self.breakers.release_probe(provider);

        let mut state = self
            .store
            .get_sync_state(&invoice_id)?
            .unwrap_or_else(|| InvoiceSyncState::new(invoice_id.clone(), provider));
        state.mark_failed(error.clone());
        self.store.put_sync_state(&state)?;

        if let Some(org) = organization_id {
            self.touch_integration(org, provider, |integration| {
                integration.record_error(error.clone());
            })?;
        }

        self.sync_queue.complete(&job)?;
        self.audit(&invoice_id, provider, AuditAction::Failed, Some(error.clone()))?;
        metrics::record_sync_outcome(provider.code(), "failed");

        warn!(invoice = %invoice_id, provider = %provider, error = %error, "Sync failed");
        Ok(JobOutcome::Failed {
            invoice_id,
            provider,
            error,
        })
    }

    // ------------------------------------------------------------------
    // Webhook application (called by webhook workers)
    // ------------------------------------------------------------------

    /// Pull and apply the next eligible webhook event
    pub fn process_next_webhook(&self) -> Result<Option<WebhookOutcome>> {
        let event = match self.webhook_queue.dequeue() {
            Some(event) => event,
            None => return Ok(None),
        };
        self.apply_webhook(event).map(Some)
    }

    fn apply_webhook(&self, event: WebhookEvent) -> Result<WebhookOutcome> {
        let event_id = event.id.clone();
        let provider = event.provider;

        let notice = match PaymentNotice::from_payload(&event.payload) {
            Ok(notice) => notice,
            Err(e) => {
                // A malformed payload never becomes valid on retry
                self.webhook_queue.discard(event, e.to_string())?;
                return Ok(WebhookOutcome::Discarded { event_id });
            }
        };

        // The event may arrive before (or instead of) the sync that would
        // record the external ID; retry on the webhook schedule
        let invoice_id = match self
            .store
            .find_by_external_id(provider, &notice.external_invoice_id)?
        {
            Some(id) => id,
            None => {
                let error = format!(
                    "no local invoice for external document {}",
                    notice.external_invoice_id
                );
                self.webhook_queue.mark_failed(event, error.clone())?;
                return Ok(WebhookOutcome::Failed { event_id, error });
            }
        };

        let payment = PaymentRecord {
            event_id: event_id.clone(),
            invoice_id: invoice_id.clone(),
            provider,
            payment_id: notice.payment_id.clone(),
            amount_cents: notice.amount_cents,
            applied_at: self.clock.now(),
        };

        // At-least-once delivery: the insert is keyed by the idempotency
        // key, so the second application of the same event is a no-op
        let inserted = self.store.insert_payment(&payment)?;
        self.webhook_queue.mark_processed(event)?;

        if inserted {
            self.audit(
                &invoice_id,
                provider,
                AuditAction::WebhookApplied,
                Some(format!(
                    "payment {} of {} cents",
                    notice.payment_id, notice.amount_cents
                )),
            )?;
            info!(
                invoice = %invoice_id,
                provider = %provider,
                payment = %notice.payment_id,
                "Payment applied from webhook"
            );
            Ok(WebhookOutcome::Applied {
                invoice_id,
                provider,
            })
        } else {
            self.audit(
                &invoice_id,
                provider,
                AuditAction::WebhookDuplicate,
                Some(format!("duplicate delivery of {}", event_id)),
            )?;
            debug!(event = %event_id, "Duplicate webhook delivery, no-op");
            Ok(WebhookOutcome::Duplicate { event_id })
        }
    }

    // ------------------------------------------------------------------
    // Operational accessors
    // ------------------------------------------------------------------

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn sync_queue_depth(&self) -> usize {
        self.sync_queue.depth()
    }

    pub fn webhook_queue_depth(&self) -> usize {
        self.webhook_queue.depth()
    }

    pub fn breaker_snapshot(&self, provider: Provider) -> BreakerSnapshot {
        self.breakers.snapshot(provider)
    }

    pub fn limiter_remaining(&self, provider: Provider) -> u32 {
        self.limiters.remaining(provider)
    }

    fn touch_integration<F>(&self, organization_id: &str, provider: Provider, f: F) -> Result<()>
    where
        F: FnOnce(&mut Integration),
    {
        let mut integration = self
            .store
            .get_integration(organization_id, provider)?
            .unwrap_or_else(|| Integration::new(organization_id, provider));
        f(&mut integration);
        self.store.upsert_integration(&integration)
    }

    fn audit(
        &self,
        invoice_id: &InvoiceId,
        provider: Provider,
        action: AuditAction,
        detail: Option<String>,
    ) -> Result<()> {
        self.store.append_audit(&AuditLogEntry::new(
            invoice_id.clone(),
            provider,
            action,
            self.clock.now(),
            detail,
        ))
    }
}
