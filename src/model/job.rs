//! Sync queue jobs

use super::{InvoiceId, JobId, Provider};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job priority
///
/// High is reserved for manual retries; within a provider, High jobs always
/// dequeue before Normal ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
        }
    }
}

/// One unit of work: "push this invoice to this provider"
///
/// Created by the enqueue API or a failure-triggered requeue; destroyed on
/// terminal success or terminal failure. The attempt count only counts real
/// provider calls - deferrals (circuit open, rate limited) requeue without
/// touching it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: JobId,

    pub invoice_id: InvoiceId,

    pub provider: Provider,

    pub priority: Priority,

    /// Number of provider calls already made for this job
    pub attempts: u32,

    /// Earliest time this job may be dequeued
    pub eligible_at: DateTime<Utc>,

    /// When the job first entered the queue (FIFO tie-break)
    pub enqueued_at: DateTime<Utc>,
}

impl SyncJob {
    pub fn new(
        id: JobId,
        invoice_id: InvoiceId,
        provider: Provider,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            invoice_id,
            provider,
            priority,
            attempts: 0,
            eligible_at: now,
            enqueued_at: now,
        }
    }

    /// Queue dedup key: one pending job per (invoice, provider) pair
    pub fn dedup_key(&self) -> (InvoiceId, Provider) {
        (self.invoice_id.clone(), self.provider)
    }

    /// Is this job eligible to run at `now`?
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.eligible_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        // High sorts before Normal (derive(Ord) on declaration order)
        assert!(Priority::High < Priority::Normal);
    }

    #[test]
    fn test_eligibility() {
        let now = Utc::now();
        let job = SyncJob::new(
            JobId::from_seq(1),
            InvoiceId::new("inv-1"),
            Provider::QuickBooks,
            Priority::Normal,
            now,
        );
        assert!(job.is_eligible(now));
        assert!(!job.is_eligible(now - chrono::Duration::seconds(1)));
    }
}
