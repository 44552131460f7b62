//! Append-only audit log
//!
//! Every sync transition writes exactly one entry. Entries are never
//! mutated or deleted; they are the history support and compliance read.

use super::{InvoiceId, Provider};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened on a sync attempt or webhook application
///
/// Deferrals get their own variants so operators can tell "provider is
/// down" apart from "we are choosing not to call it yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Initiated,
    Succeeded,
    Failed,
    Retried,
    DeferredCircuitOpen,
    DeferredRateLimited,
    WebhookApplied,
    WebhookDuplicate,
    WebhookFailed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Initiated => "initiated",
            AuditAction::Succeeded => "succeeded",
            AuditAction::Failed => "failed",
            AuditAction::Retried => "retried",
            AuditAction::DeferredCircuitOpen => "deferred_circuit_open",
            AuditAction::DeferredRateLimited => "deferred_rate_limited",
            AuditAction::WebhookApplied => "webhook_applied",
            AuditAction::WebhookDuplicate => "webhook_duplicate",
            AuditAction::WebhookFailed => "webhook_failed",
        }
    }

    /// Deferrals are not failures
    pub fn is_deferral(&self) -> bool {
        matches!(
            self,
            AuditAction::DeferredCircuitOpen | AuditAction::DeferredRateLimited
        )
    }
}

/// One audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub invoice_id: InvoiceId,

    pub provider: Provider,

    pub action: AuditAction,

    pub timestamp: DateTime<Utc>,

    /// Error text or deferral detail, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditLogEntry {
    pub fn new(
        invoice_id: InvoiceId,
        provider: Provider,
        action: AuditAction,
        timestamp: DateTime<Utc>,
        detail: Option<String>,
    ) -> Self {
        Self {
            invoice_id,
            provider,
            action,
            timestamp,
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deferral_classification() {
        assert!(AuditAction::DeferredCircuitOpen.is_deferral());
        assert!(AuditAction::DeferredRateLimited.is_deferral());
        assert!(!AuditAction::Failed.is_deferral());
        assert!(!AuditAction::Retried.is_deferral());
    }
}
