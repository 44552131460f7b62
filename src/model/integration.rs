//! Integration records
//!
//! One per (organization, provider) pair: the connection the sync layer
//! pushes through. Connection setup (OAuth flows, token refresh) lives
//! outside this layer; the orchestrator only reads the connection and
//! flips it to `Error` when credentials expire mid-sync.

use super::Provider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection status of an integration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
    Error,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }
}

/// Connection to one accounting platform for one organization
///
/// Invariant: at most one Integration per (organization, provider) pair,
/// enforced by the store key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub organization_id: String,

    pub provider: Provider,

    pub status: ConnectionStatus,

    /// When the current access token expires
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<DateTime<Utc>>,

    /// Last successful outbound sync through this integration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,

    /// Last error surfaced by the orchestrator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Integration {
    pub fn new(organization_id: impl Into<String>, provider: Provider) -> Self {
        Self {
            organization_id: organization_id.into(),
            provider,
            status: ConnectionStatus::Disconnected,
            token_expires_at: None,
            last_synced_at: None,
            last_error: None,
        }
    }

    /// Record a successful sync through this integration
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.status = ConnectionStatus::Connected;
        self.last_synced_at = Some(at);
        self.last_error = None;
    }

    /// Record a terminal sync error against this integration
    pub fn record_error(&mut self, message: String) {
        self.last_error = Some(message);
    }

    /// Credentials expired mid-sync: the integration needs reconnection
    pub fn mark_auth_expired(&mut self, message: String) {
        self.status = ConnectionStatus::Error;
        self.last_error = Some(message);
    }
}
