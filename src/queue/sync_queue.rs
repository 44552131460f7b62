//! Outbound sync queue
//!
//! Holds pending sync jobs and yields them in priority order, honoring
//! each job's earliest-eligible-retry timestamp. One pending job per
//! (invoice, provider) pair: a duplicate enqueue updates the existing
//! entry in place instead of adding a second job, which is the primary
//! defense against double-submission from rapid duplicate user clicks.

use crate::clock::SharedClock;
use crate::metrics;
use crate::model::{InvoiceId, JobId, Priority, Provider, SyncJob};
use crate::store::SharedStore;
use crate::Result;
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Priority + eligibility ordered job list
///
/// Dequeue is a non-blocking poll: workers sleep between empty polls.
/// Jobs stay persisted until their terminal transition, so a crash after
/// dequeue but before completion re-delivers the job at startup.
pub struct SyncQueue {
    inner: Mutex<Inner>,
    store: SharedStore,
    clock: SharedClock,
}

struct Inner {
    jobs: HashMap<(InvoiceId, Provider), SyncJob>,
    next_seq: u64,
}

impl SyncQueue {
    pub fn new(store: SharedStore, clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                next_seq: 1,
            }),
            store,
            clock,
        }
    }

    /// Reload persisted jobs after a restart
    ///
    /// Returns the number of jobs recovered.
    pub fn recover(&self) -> Result<usize> {
        let jobs = self.store.load_jobs()?;
        let mut inner = self.inner.lock().unwrap();

        for job in &jobs {
            // Resume the sequence counter past every recovered ID
            if let Some(seq) = job
                .id
                .as_str()
                .strip_prefix("sj-")
                .and_then(|s| s.parse::<u64>().ok())
            {
                inner.next_seq = inner.next_seq.max(seq + 1);
            }
            inner.jobs.insert(job.dedup_key(), job.clone());
        }

        let recovered = inner.jobs.len();
        drop(inner);
        self.publish_gauges();
        Ok(recovered)
    }

    /// Add a job, or update the matching pending job in place
    ///
    /// An equivalent job (same invoice + provider) is never duplicated:
    /// its priority is upgraded if the new request is High, and its
    /// identity, attempt count and queue position are kept.
    pub fn enqueue(
        &self,
        invoice_id: InvoiceId,
        provider: Provider,
        priority: Priority,
    ) -> Result<JobId> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        let key = (invoice_id.clone(), provider);

        if let Some(existing) = inner.jobs.get_mut(&key) {
            // Upgrade only; a Normal enqueue never demotes a High job
            if priority < existing.priority {
                existing.priority = priority;
                let updated = existing.clone();
                debug!(job = %updated.id, invoice = %invoice_id, "Upgraded pending job priority");
                self.store.save_job(&updated)?;
            }
            return Ok(inner.jobs[&key].id.clone());
        }

        let id = JobId::from_seq(inner.next_seq);
        inner.next_seq += 1;

        let job = SyncJob::new(id.clone(), invoice_id, provider, priority, now);
        self.store.save_job(&job)?;
        inner.jobs.insert(key, job);
        drop(inner);

        self.publish_gauges();
        Ok(id)
    }

    /// Is a job pending for this (invoice, provider) pair?
    pub fn contains(&self, invoice_id: &InvoiceId, provider: Provider) -> bool {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .contains_key(&(invoice_id.clone(), provider))
    }

    /// Pull the next eligible job, if any
    ///
    /// Highest priority first; FIFO by enqueue time within a priority
    /// class. The job leaves the in-memory queue but stays persisted
    /// until `complete` (or a requeue) - the dequeuing worker owns it
    /// start-to-finish.
    pub fn dequeue(&self) -> Option<SyncJob> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();

        let key = inner
            .jobs
            .values()
            .filter(|job| job.is_eligible(now))
            .min_by_key(|job| (job.priority, job.enqueued_at))
            .map(|job| job.dedup_key())?;

        let job = inner.jobs.remove(&key);
        drop(inner);

        self.publish_gauges();
        job
    }

    /// Re-insert a job after a real attempt failed
    ///
    /// Increments the attempt count and pushes eligibility out by the
    /// backoff delay.
    pub fn requeue_retry(&self, mut job: SyncJob, delay: std::time::Duration) -> Result<()> {
        job.attempts += 1;
        self.requeue(job, delay)
    }

    /// Re-insert a deferred job (circuit open / rate limited)
    ///
    /// Deferrals are "not yet", not failures: the attempt count is
    /// untouched.
    pub fn requeue_deferred(&self, job: SyncJob, delay: std::time::Duration) -> Result<()> {
        self.requeue(job, delay)
    }

    fn requeue(&self, mut job: SyncJob, delay: std::time::Duration) -> Result<()> {
        job.eligible_at = self.clock.now()
            + Duration::from_std(delay).unwrap_or_else(|_| Duration::seconds(60));
        self.store.save_job(&job)?;

        debug!(
            job = %job.id,
            invoice = %job.invoice_id,
            attempts = job.attempts,
            eligible_at = %job.eligible_at,
            "Requeued sync job"
        );

        let mut inner = self.inner.lock().unwrap();
        inner.jobs.insert(job.dedup_key(), job);
        drop(inner);

        self.publish_gauges();
        Ok(())
    }

    /// Drop a job on terminal success or terminal failure
    pub fn complete(&self, job: &SyncJob) -> Result<()> {
        self.store.delete_job(&job.id)?;
        self.publish_gauges();
        Ok(())
    }

    /// Number of pending jobs
    pub fn depth(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    /// Age of the oldest pending job
    pub fn oldest_age(&self) -> Option<Duration> {
        let now = self.clock.now();
        let inner = self.inner.lock().unwrap();
        inner
            .jobs
            .values()
            .map(|job| now - job.enqueued_at)
            .max()
    }

    fn publish_gauges(&self) {
        metrics::set_sync_queue_depth(self.depth() as i64);
        let age_secs = self
            .oldest_age()
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);
        metrics::set_sync_queue_oldest_age(age_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    fn queue() -> (SyncQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        (SyncQueue::new(store, clock.clone()), clock)
    }

    #[test]
    fn test_enqueue_dedups_by_invoice_and_provider() {
        let (queue, _) = queue();

        let first = queue
            .enqueue(InvoiceId::new("inv-1"), Provider::QuickBooks, Priority::Normal)
            .unwrap();
        let second = queue
            .enqueue(InvoiceId::new("inv-1"), Provider::QuickBooks, Priority::Normal)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(queue.depth(), 1);

        // Same invoice, different provider: a separate job
        queue
            .enqueue(InvoiceId::new("inv-1"), Provider::Xero, Priority::Normal)
            .unwrap();
        assert_eq!(queue.depth(), 2);
    }

    #[test]
    fn test_duplicate_enqueue_upgrades_priority_only() {
        let (queue, _) = queue();

        queue
            .enqueue(InvoiceId::new("inv-1"), Provider::QuickBooks, Priority::Normal)
            .unwrap();
        queue
            .enqueue(InvoiceId::new("inv-1"), Provider::QuickBooks, Priority::High)
            .unwrap();

        let job = queue.dequeue().unwrap();
        assert_eq!(job.priority, Priority::High);

        // And a Normal re-enqueue never demotes High
        queue
            .enqueue(InvoiceId::new("inv-2"), Provider::QuickBooks, Priority::High)
            .unwrap();
        queue
            .enqueue(InvoiceId::new("inv-2"), Provider::QuickBooks, Priority::Normal)
            .unwrap();
        assert_eq!(queue.dequeue().unwrap().priority, Priority::High);
    }

    #[test]
    fn test_dequeue_priority_then_fifo() {
        let (queue, clock) = queue();

        queue
            .enqueue(InvoiceId::new("inv-a"), Provider::QuickBooks, Priority::Normal)
            .unwrap();
        clock.advance(Duration::seconds(1));
        queue
            .enqueue(InvoiceId::new("inv-b"), Provider::QuickBooks, Priority::Normal)
            .unwrap();
        clock.advance(Duration::seconds(1));
        queue
            .enqueue(InvoiceId::new("inv-c"), Provider::QuickBooks, Priority::High)
            .unwrap();

        assert_eq!(queue.dequeue().unwrap().invoice_id, InvoiceId::new("inv-c"));
        assert_eq!(queue.dequeue().unwrap().invoice_id, InvoiceId::new("inv-a"));
        assert_eq!(queue.dequeue().unwrap().invoice_id, InvoiceId::new("inv-b"));
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_requeued_job_waits_for_eligibility() {
        let (queue, clock) = queue();

        queue
            .enqueue(InvoiceId::new("inv-1"), Provider::QuickBooks, Priority::Normal)
            .unwrap();
        let job = queue.dequeue().unwrap();

        queue
            .requeue_retry(job, StdDuration::from_secs(30))
            .unwrap();
        assert!(queue.dequeue().is_none());

        clock.advance(Duration::seconds(31));
        let job = queue.dequeue().unwrap();
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn test_deferred_requeue_does_not_count_attempt() {
        let (queue, clock) = queue();

        queue
            .enqueue(InvoiceId::new("inv-1"), Provider::QuickBooks, Priority::Normal)
            .unwrap();
        let job = queue.dequeue().unwrap();

        queue
            .requeue_deferred(job, StdDuration::from_secs(5))
            .unwrap();
        clock.advance(Duration::seconds(6));
        assert_eq!(queue.dequeue().unwrap().attempts, 0);
    }

    #[test]
    fn test_recover_restores_jobs_and_sequence() {
        let clock: Arc<ManualClock> = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());

        {
            let queue = SyncQueue::new(store.clone(), clock.clone());
            queue
                .enqueue(InvoiceId::new("inv-1"), Provider::QuickBooks, Priority::Normal)
                .unwrap();
            queue
                .enqueue(InvoiceId::new("inv-2"), Provider::Xero, Priority::High)
                .unwrap();
        }

        let queue = SyncQueue::new(store, clock);
        assert_eq!(queue.recover().unwrap(), 2);
        assert_eq!(queue.depth(), 2);

        // New IDs continue past the recovered ones
        let id = queue
            .enqueue(InvoiceId::new("inv-3"), Provider::Xero, Priority::Normal)
            .unwrap();
        assert_eq!(id.as_str(), "sj-3");
    }
}
