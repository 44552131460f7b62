//! Sync orchestration
//!
//! `SyncService` is the coordinating state machine: it owns the queues,
//! the breaker and limiter registries, and the per-job execution path
//! (gate checks, provider call, outcome classification, audit). The
//! `SyncDaemon` wraps it in a long-running process: worker pools, command
//! channel, event stream, graceful shutdown.

mod daemon;
mod service;

pub use daemon::{SyncCommand, SyncDaemon, SyncDaemonBuilder, SyncEvent};
pub use service::{DeferralReason, JobOutcome, SyncService, WebhookOutcome};
