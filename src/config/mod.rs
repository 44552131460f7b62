//! Configuration system
//!
//! Loads and manages the ledgersync YAML config file. Every operational
//! tuning value lives here - backoff constants, breaker thresholds and
//! cooldowns, per-provider quotas, worker counts - rather than being
//! hard-coded in the components that consume them.

use crate::model::Provider;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Retry/backoff policy for transient provider failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (typically 2.0 for exponential backoff)
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Add random jitter to prevent thundering herd
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Backoff delay for a given attempt number (0-based)
    ///
    /// base × multiplier^attempt, capped, plus 0-25% jitter when enabled.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64);

        let final_ms = if self.jitter {
            capped * (1.0 + rand_jitter() * 0.25)
        } else {
            capped
        };

        Duration::from_millis(final_ms as u64)
    }
}

/// Simple pseudo-random jitter (0.0 to 1.0) without external dependency
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// Circuit breaker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Initial cooldown before a half-open probe, in milliseconds
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Cooldown cap for repeated probe failures, in milliseconds
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_max_cooldown_ms() -> u64 {
    300_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            max_cooldown_ms: default_max_cooldown_ms(),
        }
    }
}

impl BreakerConfig {
    /// Cooldown after the given number of consecutive probe failures
    ///
    /// Grows as a bounded exponential so repeated failed probes do not
    /// thrash a struggling provider.
    pub fn cooldown_after(&self, probe_failures: u32) -> Duration {
        let ms = (self.cooldown_ms as f64 * 2f64.powi(probe_failures.min(16) as i32))
            .min(self.max_cooldown_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Per-provider API quota
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Calls allowed per window
    #[serde(default = "default_max_calls")]
    pub max_calls: u32,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

fn default_max_calls() -> u32 {
    30
}

fn default_window_ms() -> u64 {
    60_000
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_calls: default_max_calls(),
            window_ms: default_window_ms(),
        }
    }
}

/// Connection settings for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// API base URL
    pub base_url: String,

    /// Environment variable holding the API token
    #[serde(default)]
    pub token_env: Option<String>,

    /// Environment variable holding the webhook signing secret
    #[serde(default)]
    pub webhook_secret_env: Option<String>,

    /// Published API quota for this provider
    #[serde(default)]
    pub quota: QuotaConfig,
}

/// Worker pool sizing and pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Orchestrator workers pulling from the sync queue
    #[serde(default = "default_sync_workers")]
    pub sync_workers: usize,

    /// Webhook consumers (independent pool, never blocked by outbound syncs)
    #[serde(default = "default_webhook_workers")]
    pub webhook_workers: usize,

    /// Idle poll interval when a queue is empty, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_sync_workers() -> usize {
    4
}

fn default_webhook_workers() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sync_workers: default_sync_workers(),
            webhook_workers: default_webhook_workers(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Webhook ingestion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Maximum buffered events before the receipt endpoint starts
    /// returning 503 (provider retries take over)
    #[serde(default = "default_webhook_capacity")]
    pub capacity: usize,

    /// Processing attempts before an event needs manual intervention
    #[serde(default = "default_webhook_max_attempts")]
    pub max_attempts: u32,

    /// Delay between processing attempts, in milliseconds
    #[serde(default = "default_webhook_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_webhook_capacity() -> usize {
    1_024
}

fn default_webhook_max_attempts() -> u32 {
    5
}

fn default_webhook_retry_delay_ms() -> u64 {
    30_000
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            capacity: default_webhook_capacity(),
            max_attempts: default_webhook_max_attempts(),
            retry_delay_ms: default_webhook_retry_delay_ms(),
        }
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_server_addr")]
    pub addr: String,

    /// Request body size limit in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_server_addr() -> String {
    "127.0.0.1:8086".to_string()
}

fn default_max_body_size() -> usize {
    1024 * 1024 // 1MB
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
            max_body_size: default_max_body_size(),
        }
    }
}

/// LedgerSync configuration
///
/// Represents the complete config.yaml file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// SQLite database path
    #[serde(default = "default_database_path")]
    pub database: PathBuf,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Per-provider connection settings, keyed by provider code
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

fn default_database_path() -> PathBuf {
    // Always use ~/.config for consistency across platforms (macOS, Linux)
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".config");
    path.push("ledgersync");
    path.push("ledgersync.db");
    path
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            server: ServerConfig::default(),
            workers: WorkerConfig::default(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            webhook: WebhookConfig::default(),
            providers: HashMap::new(),
        }
    }
}

impl SyncConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Default config path (~/.config/ledgersync/config.yaml)
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("ledgersync");
        path.push("config.yaml");
        path
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::SyncError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading ledgersync configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;

        tracing::debug!(
            providers = config.providers.len(),
            sync_workers = config.workers.sync_workers,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to a path
    pub fn save(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> crate::Result<()> {
        if self.workers.sync_workers == 0 {
            return Err(crate::SyncError::Config(
                "workers.sync_workers must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(crate::SyncError::Config(
                "retry.multiplier must be >= 1.0".to_string(),
            ));
        }
        for (code, provider) in &self.providers {
            code.parse::<Provider>()?;
            if provider.base_url.is_empty() {
                return Err(crate::SyncError::Config(format!(
                    "providers.{}.base_url must not be empty",
                    code
                )));
            }
            if provider.quota.max_calls == 0 {
                return Err(crate::SyncError::Config(format!(
                    "providers.{}.quota.max_calls must be at least 1",
                    code
                )));
            }
        }
        Ok(())
    }

    /// Settings for one provider, if configured
    pub fn provider(&self, provider: Provider) -> Option<&ProviderConfig> {
        self.providers.get(provider.code())
    }

    /// Quota for one provider (default quota when not configured)
    pub fn quota(&self, provider: Provider) -> QuotaConfig {
        self.provider(provider)
            .map(|p| p.quota.clone())
            .unwrap_or_default()
    }

    /// Set the database path
    pub fn with_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.database = path.into();
        self
    }

    /// Set worker pool sizes
    pub fn with_workers(mut self, sync_workers: usize, webhook_workers: usize) -> Self {
        self.workers.sync_workers = sync_workers;
        self.workers.webhook_workers = webhook_workers;
        self
    }

    /// Register a provider
    pub fn with_provider(mut self, provider: Provider, config: ProviderConfig) -> Self {
        self.providers.insert(provider.code().to_string(), config);
        self
    }
}
