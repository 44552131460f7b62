//! Provider clients
//!
//! One capability interface (`ProviderClient`) implemented by an adapter
//! per accounting platform. The adapter owns the wire format and maps
//! HTTP outcomes into the typed error taxonomy; callers never see raw
//! transport errors. Clients are selected once per job from the registry,
//! keyed by the closed `Provider` enum.

pub mod mock;
pub mod quickbooks;
pub mod xero;

pub use mock::MockProviderClient;
pub use quickbooks::QuickBooksAdapter;
pub use xero::XeroAdapter;

use crate::config::SyncConfig;
use crate::model::{InvoiceSnapshot, Provider};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Typed provider call failure
///
/// Classification happens inside the adapter, once, against the HTTP
/// outcome. Transient errors count against the provider's circuit
/// breaker; permanent and auth errors do not - they say nothing about
/// the dependency's health.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Timeouts, connection failures, 5xx: expected to succeed on retry
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// Validation failures and other 4xx: will never succeed unchanged
    #[error("Permanent provider error: {0}")]
    Permanent(String),

    /// Credentials expired: terminal, and the integration needs
    /// reconnection before any further syncs
    #[error("Provider authentication expired: {0}")]
    AuthExpired(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// Classify a reqwest transport error (no HTTP status available)
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ProviderError::Transient(format!("network error: {}", err))
        } else {
            // Body/decode errors on an otherwise reachable provider:
            // retrying is the safe default
            ProviderError::Transient(format!("request error: {}", err))
        }
    }
}

/// Receipt for a successfully created or updated external document
#[derive(Debug, Clone)]
pub struct ProviderReceipt {
    /// The provider's document ID
    pub external_id: String,
}

/// The capability interface the orchestrator depends on
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Which provider this client talks to
    fn provider(&self) -> Provider;

    /// Create or update the external document for this invoice
    async fn sync_invoice(
        &self,
        invoice: &InvoiceSnapshot,
    ) -> Result<ProviderReceipt, ProviderError>;
}

/// Registry of provider clients, keyed by the closed provider set
pub struct ProviderRegistry {
    clients: HashMap<Provider, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
        }
    }

    /// Build adapters for every provider named in the configuration
    pub fn from_config(config: &SyncConfig) -> crate::Result<Self> {
        let mut registry = Self::new();
        for (code, provider_config) in &config.providers {
            let provider: Provider = code.parse()?;
            let client: Arc<dyn ProviderClient> = match provider {
                Provider::QuickBooks => {
                    Arc::new(QuickBooksAdapter::from_config(provider_config)?)
                }
                Provider::Xero => Arc::new(XeroAdapter::from_config(provider_config)?),
            };
            registry.register(client);
        }
        Ok(registry)
    }

    pub fn register(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients.insert(client.provider(), client);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(&provider).cloned()
    }

    pub fn is_configured(&self, provider: Provider) -> bool {
        self.clients.contains_key(&provider)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Transient("timeout".to_string()).is_transient());
        assert!(!ProviderError::Permanent("422".to_string()).is_transient());
        assert!(!ProviderError::AuthExpired("401".to_string()).is_transient());
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ProviderRegistry::new();
        assert!(!registry.is_configured(Provider::Xero));

        registry.register(Arc::new(MockProviderClient::new(Provider::Xero)));
        assert!(registry.is_configured(Provider::Xero));
        assert!(registry.get(Provider::Xero).is_some());
        assert!(registry.get(Provider::QuickBooks).is_none());
    }
}
