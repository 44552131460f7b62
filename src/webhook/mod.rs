//! HTTP surface
//!
//! The webhook receipt endpoint (signature-checked, acknowledge-on-
//! durable-enqueue), the sync enqueue/status API consumed by the route
//! layer, and the metrics/health endpoints for the operational dashboard.

mod server;
mod signature;

pub use server::{SyncServer, ServerError};
pub use signature::{AllowAllVerifier, SharedSecretVerifier, SignatureVerifier};
