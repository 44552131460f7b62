//! Scripted provider client for tests
//!
//! Returns a queued sequence of outcomes and records every call, so the
//! orchestrator's retry, breaker and backoff behavior can be exercised
//! without a network.

use super::{ProviderClient, ProviderError, ProviderReceipt};
use crate::model::{InvoiceId, InvoiceSnapshot, Provider};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Scripted provider client
///
/// Outcomes are consumed in order; when the script is empty every call
/// succeeds with a generated external ID.
pub struct MockProviderClient {
    provider: Provider,
    script: Mutex<VecDeque<Result<ProviderReceipt, ProviderError>>>,
    calls: Mutex<Vec<InvoiceId>>,
}

impl MockProviderClient {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue the next outcome
    pub fn push_outcome(&self, outcome: Result<ProviderReceipt, ProviderError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    /// Queue `n` transient failures
    pub fn push_transient_failures(&self, n: usize) {
        for _ in 0..n {
            self.push_outcome(Err(ProviderError::Transient("HTTP 503".to_string())));
        }
    }

    /// Queue a success with the given external ID
    pub fn push_success(&self, external_id: &str) {
        self.push_outcome(Ok(ProviderReceipt {
            external_id: external_id.to_string(),
        }));
    }

    /// Invoices this client was called with, in order
    pub fn calls(&self) -> Vec<InvoiceId> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ProviderClient for MockProviderClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn sync_invoice(
        &self,
        invoice: &InvoiceSnapshot,
    ) -> Result<ProviderReceipt, ProviderError> {
        self.calls.lock().unwrap().push(invoice.invoice_id.clone());

        match self.script.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(ProviderReceipt {
                external_id: format!("{}-ext-{}", self.provider.code(), invoice.invoice_id),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot() -> InvoiceSnapshot {
        InvoiceSnapshot {
            invoice_id: InvoiceId::new("inv-1"),
            organization_id: "org-1".to_string(),
            invoice_number: "INV-1".to_string(),
            customer_name: "Acme".to_string(),
            total_cents: 100,
            currency: "USD".to_string(),
            issued_at: Utc::now(),
            memo: None,
        }
    }

    #[tokio::test]
    async fn test_scripted_outcomes_in_order() {
        let mock = MockProviderClient::new(Provider::QuickBooks);
        mock.push_transient_failures(1);
        mock.push_success("qb-9");

        assert!(mock.sync_invoice(&snapshot()).await.is_err());
        let receipt = mock.sync_invoice(&snapshot()).await.unwrap();
        assert_eq!(receipt.external_id, "qb-9");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_script_defaults_to_success() {
        let mock = MockProviderClient::new(Provider::Xero);
        let receipt = mock.sync_invoice(&snapshot()).await.unwrap();
        assert_eq!(receipt.external_id, "xero-ext-inv-1");
    }
}
