//! QuickBooks Online adapter
//!
//! Pushes invoices through the QBO v3 REST API.

use super::{ProviderClient, ProviderError, ProviderReceipt};
use crate::config::ProviderConfig;
use crate::model::{InvoiceSnapshot, Provider};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Per-request timeout for document writes
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// QuickBooks Online API client
pub struct QuickBooksAdapter {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct QboInvoiceRequest<'a> {
    #[serde(rename = "DocNumber")]
    doc_number: &'a str,
    #[serde(rename = "CustomerRef")]
    customer_ref: QboRef<'a>,
    #[serde(rename = "TotalAmt")]
    total_amt: f64,
    #[serde(rename = "CurrencyRef")]
    currency_ref: QboRef<'a>,
    #[serde(rename = "PrivateNote", skip_serializing_if = "Option::is_none")]
    private_note: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct QboRef<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct QboInvoiceResponse {
    #[serde(rename = "Invoice")]
    invoice: QboInvoice,
}

#[derive(Debug, Deserialize)]
struct QboInvoice {
    #[serde(rename = "Id")]
    id: String,
}

impl QuickBooksAdapter {
    /// Build an adapter from provider configuration
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn from_config(config: &ProviderConfig) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(WRITE_TIMEOUT)
            .build()
            .map_err(|e| crate::SyncError::Config(format!("HTTP client: {}", e)))?;

        let auth_token = config
            .token_env
            .as_ref()
            .and_then(|env_var| std::env::var(env_var.trim_start_matches('$')).ok());

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_token.is_some()
    }
}

#[async_trait]
impl ProviderClient for QuickBooksAdapter {
    fn provider(&self) -> Provider {
        Provider::QuickBooks
    }

    async fn sync_invoice(
        &self,
        invoice: &InvoiceSnapshot,
    ) -> Result<ProviderReceipt, ProviderError> {
        let url = format!("{}/invoice", self.base_url);

        let body = QboInvoiceRequest {
            doc_number: &invoice.invoice_number,
            customer_ref: QboRef {
                name: &invoice.customer_name,
            },
            total_amt: invoice.total_cents as f64 / 100.0,
            currency_ref: QboRef {
                name: &invoice.currency,
            },
            private_note: invoice.memo.as_deref(),
        };

        debug!(invoice = %invoice.invoice_id, "Pushing invoice to QuickBooks");

        let mut request = self.client.post(&url).json(&body);
        if let Some(ref token) = self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let parsed: QboInvoiceResponse = response
                    .json()
                    .await
                    .map_err(ProviderError::from_transport)?;
                info!(
                    invoice = %invoice.invoice_id,
                    external_id = %parsed.invoice.id,
                    "QuickBooks invoice created"
                );
                Ok(ProviderReceipt {
                    external_id: parsed.invoice.id,
                })
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProviderError::AuthExpired(
                "QuickBooks authentication rejected".to_string(),
            )),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                Err(ProviderError::Transient(format!(
                    "QuickBooks rate limited, retry after {} seconds",
                    retry_after
                )))
            }
            status if status.is_server_error() => {
                let error_body = response.text().await.unwrap_or_default();
                Err(ProviderError::Transient(format!(
                    "QuickBooks API error: HTTP {}: {}",
                    status, error_body
                )))
            }
            status => {
                // Remaining 4xx: the document itself was rejected
                let error_body = response.text().await.unwrap_or_default();
                Err(ProviderError::Permanent(format!(
                    "QuickBooks rejected invoice: HTTP {}: {}",
                    status, error_body
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuotaConfig;

    fn config() -> ProviderConfig {
        ProviderConfig {
            base_url: "https://qb.example.test/v3/company/123/".to_string(),
            token_env: None,
            webhook_secret_env: None,
            quota: QuotaConfig::default(),
        }
    }

    #[test]
    fn test_from_config_trims_trailing_slash() {
        let adapter = QuickBooksAdapter::from_config(&config()).unwrap();
        assert_eq!(adapter.base_url, "https://qb.example.test/v3/company/123");
        assert!(!adapter.is_authenticated());
    }

    #[test]
    fn test_with_token() {
        let adapter = QuickBooksAdapter::from_config(&config())
            .unwrap()
            .with_token("tok-123");
        assert!(adapter.is_authenticated());
    }

    #[test]
    fn test_request_body_shape() {
        let body = QboInvoiceRequest {
            doc_number: "INV-1",
            customer_ref: QboRef { name: "Acme" },
            total_amt: 1250.0,
            currency_ref: QboRef { name: "USD" },
            private_note: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["DocNumber"], "INV-1");
        assert_eq!(json["CustomerRef"]["name"], "Acme");
        assert!(json.get("PrivateNote").is_none());
    }
}
