//! Core data model
//!
//! The sync-relevant projections of the product's records: providers,
//! invoice sync state, integrations, queue jobs, webhook events, and the
//! append-only audit log.

pub mod audit;
pub mod ids;
pub mod integration;
pub mod invoice;
pub mod job;
pub mod webhook;

pub use audit::{AuditAction, AuditLogEntry};
pub use ids::{InvoiceId, JobId, WebhookEventId};
pub use integration::{ConnectionStatus, Integration};
pub use invoice::{InvoiceSnapshot, InvoiceSyncState, SyncStatus, SyncStatusReport};
pub use job::{Priority, SyncJob};
pub use webhook::{PaymentNotice, PaymentRecord, WebhookEvent, WebhookStatus};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// External accounting platform
///
/// A closed set: the provider for a job is selected once at job-creation
/// time, never re-dispatched from a runtime string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    QuickBooks,
    Xero,
}

impl Provider {
    /// All supported providers
    pub const ALL: [Provider; 2] = [Provider::QuickBooks, Provider::Xero];

    /// Stable lowercase code used in config files, URLs and the database
    pub fn code(&self) -> &'static str {
        match self {
            Provider::QuickBooks => "quickbooks",
            Provider::Xero => "xero",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for Provider {
    type Err = crate::SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "quickbooks" | "qbo" => Ok(Provider::QuickBooks),
            "xero" => Ok(Provider::Xero),
            other => Err(crate::SyncError::UnknownProvider(other.to_string())),
        }
    }
}
