//! Xero adapter
//!
//! Pushes invoices through the Xero accounting API.

use super::{ProviderClient, ProviderError, ProviderReceipt};
use crate::config::ProviderConfig;
use crate::model::{InvoiceSnapshot, Provider};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Xero API client
pub struct XeroAdapter {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct XeroInvoiceRequest<'a> {
    #[serde(rename = "Type")]
    invoice_type: &'static str,
    #[serde(rename = "InvoiceNumber")]
    invoice_number: &'a str,
    #[serde(rename = "Contact")]
    contact: XeroContact<'a>,
    #[serde(rename = "Total")]
    total: f64,
    #[serde(rename = "CurrencyCode")]
    currency_code: &'a str,
    #[serde(rename = "Reference", skip_serializing_if = "Option::is_none")]
    reference: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct XeroContact<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct XeroInvoicesResponse {
    #[serde(rename = "Invoices")]
    invoices: Vec<XeroInvoice>,
}

#[derive(Debug, Deserialize)]
struct XeroInvoice {
    #[serde(rename = "InvoiceID")]
    invoice_id: String,
}

impl XeroAdapter {
    /// Build an adapter from provider configuration
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
impl ProviderClient for XeroAdapter {
    fn provider(&self) -> Provider {
        Provider::Xero
    }

    async fn sync_invoice(
        &self,
        invoice: &InvoiceSnapshot,
    ) -> Result<ProviderReceipt, ProviderError> {
        let url = format!("{}/Invoices", self.base_url);

        let body = XeroInvoiceRequest {
            invoice_type: "ACCREC",
            invoice_number: &invoice.invoice_number,
            contact: XeroContact {
                name: &invoice.customer_name,
            },
            total: invoice.total_cents as f64 / 100.0,
            currency_code: &invoice.currency,
            reference: invoice.memo.as_deref(),
        };

        debug!(invoice = %invoice.invoice_id, "Pushing invoice to Xero");

        let mut request = self.client.post(&url).json(&body);
        if let Some(ref token) = self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        match response.status() {
            StatusCode::OK => {
                let parsed: XeroInvoicesResponse = response
                    .json()
                    .await
                    .map_err(ProviderError::from_transport)?;
                let external_id = parsed
                    .invoices
                    .into_iter()
                    .next()
                    .map(|i| i.invoice_id)
                    .ok_or_else(|| {
                        ProviderError::Transient(
                            "Xero returned an empty Invoices array".to_string(),
                        )
                    })?;
                info!(
                    invoice = %invoice.invoice_id,
                    external_id = %external_id,
                    "Xero invoice created"
                );
                Ok(ProviderReceipt { external_id })
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProviderError::AuthExpired(
                "Xero authentication rejected".to_string(),
            )),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                Err(ProviderError::Transient(format!(
                    "Xero rate limited, retry after {} seconds",
                    retry_after
                )))
            }
            status if status.is_server_error() => {
                let error_body = response.text().await.unwrap_or_default();
                Err(ProviderError::Transient(format!(
                    "Xero API error: HTTP {}: {}",
                    status, error_body
                )))
            }
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(ProviderError::Permanent(format!(
                    "Xero rejected invoice: HTTP {}: {}",
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

    #[test]
    fn test_from_config() {
        let adapter = XeroAdapter::from_config(&ProviderConfig {
            base_url: "https://api.xero.example.test/api.xro/2.0/".to_string(),
            token_env: Some("XERO_TOKEN".to_string()),
            webhook_secret_env: None,
            quota: QuotaConfig::default(),
        })
        .unwrap();
        assert_eq!(adapter.base_url, "https://api.xero.example.test/api.xro/2.0");
    }

    #[test]
    fn test_request_body_shape() {
        let body = XeroInvoiceRequest {
            invoice_type: "ACCREC",
            invoice_number: "INV-7",
            contact: XeroContact { name: "Acme" },
            total: 99.5,
            currency_code: "NZD",
            reference: Some("job 12"),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["Type"], "ACCREC");
        assert_eq!(json["Contact"]["Name"], "Acme");
        assert_eq!(json["Reference"], "job 12");
    }
}
