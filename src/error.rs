//! Error types for LedgerSync
//!
//! Defines a comprehensive error enum covering all failure modes across the system.
//! Uses thiserror for ergonomic error handling.
//!
//! Provider call outcomes (transient / permanent / auth-expired) live in
//! [`crate::provider::ProviderError`]; this enum covers everything the rest
//! of the system can surface, including the synchronous enqueue-time
//! rejections the route layer sees.

use thiserror::Error;

/// Result type alias for LedgerSync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Comprehensive error type for LedgerSync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage/database errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// A sync is already pending for this invoice/provider pair
    #[error("Sync already pending for invoice {invoice_id} on provider {provider}")]
    AlreadySyncing {
        invoice_id: String,
        provider: String,
    },

    /// The invoice already synced successfully; a new sync would risk
    /// double-posting the document
    #[error("Invoice {invoice_id} already synced (external id {external_id})")]
    AlreadySynced {
        invoice_id: String,
        external_id: String,
    },

    /// Provider code not recognized
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// Invoice not found in the local store
    #[error("Invoice not found: {0}")]
    InvoiceNotFound(String),

    /// Webhook ingestion queue is at capacity
    #[error("Webhook queue full ({capacity} events)")]
    WebhookQueueFull { capacity: usize },

    /// Webhook payload missing required fields
    #[error("Invalid webhook payload: {0}")]
    InvalidWebhook(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP request errors (CLI client commands)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),

    /// Anyhow errors (for more context)
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl SyncError {
    /// True for errors the enqueue API reports synchronously to its caller
    /// rather than logging as a sync failure.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            SyncError::AlreadySyncing { .. }
                | SyncError::AlreadySynced { .. }
                | SyncError::UnknownProvider(_)
                | SyncError::InvoiceNotFound(_)
                | SyncError::InvalidWebhook(_)
        )
    }
}
