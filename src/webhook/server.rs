//! HTTP server
//!
//! Exposes the sync layer over HTTP:
//! - `POST /webhooks/{provider}` - webhook receipt; 202 once the event is
//!   durably queued, 401 on a bad signature (not retried by providers),
//!   503 when the queue cannot accept the event (triggers provider retry)
//! - `POST /sync` - enqueue API for the route layer
//! - `GET /sync/{invoice_id}` - status query
//! - `GET /metrics` - Prometheus text for the operational dashboard
//! - `GET /health`

use super::SignatureVerifier;
use crate::metrics;
use crate::model::{InvoiceId, Priority, Provider, SyncStatusReport};
use crate::orchestrator::SyncService;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;

/// Signature header checked on webhook receipt
const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Server error types
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Bind error: {0}")]
    Bind(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

struct AppState {
    service: Arc<SyncService>,
    verifier: Arc<dyn SignatureVerifier>,
}

/// HTTP server for the sync layer
pub struct SyncServer {
    state: Arc<AppState>,
    max_body_size: usize,
}

impl SyncServer {
    pub fn new(service: Arc<SyncService>, verifier: Arc<dyn SignatureVerifier>) -> Self {
        let max_body_size = service.config().server.max_body_size;
        Self {
            state: Arc::new(AppState { service, verifier }),
            max_body_size,
        }
    }

    fn router(state: Arc<AppState>, max_body_size: usize) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/metrics", get(metrics_text))
            .route("/sync", post(enqueue_sync))
            .route("/sync/{invoice_id}", get(sync_status))
            .route("/webhooks/{provider}", post(receive_webhook))
            .layer(axum::extract::DefaultBodyLimit::max(max_body_size))
            .with_state(state)
    }

    /// Run the server on the given address
    pub async fn run(self, addr: &str) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(e.to_string()))?;

        tracing::info!(addr = addr, "Sync server listening");

        axum::serve(listener, Self::router(self.state, self.max_body_size))
            .await
            .map_err(ServerError::Io)
    }

    /// Router for in-process tests
    pub fn test_router(self) -> Router {
        Self::router(self.state, self.max_body_size)
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

/// Request to enqueue a sync
#[derive(Debug, Deserialize)]
pub struct EnqueueSyncRequest {
    pub invoice_id: String,
    pub provider: String,
    /// "high" for manual retries; defaults to "normal"
    #[serde(default)]
    pub priority: Option<String>,
}

/// Response from enqueueing a sync
#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueSyncResponse {
    pub job_id: String,
}

/// Response from accepting a webhook
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookAcceptedResponse {
    pub event_id: String,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

/// Map an enqueue-time error onto an HTTP status
fn enqueue_error(err: crate::SyncError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        crate::SyncError::AlreadySyncing { .. } | crate::SyncError::AlreadySynced { .. } => {
            StatusCode::CONFLICT
        }
        crate::SyncError::InvoiceNotFound(_) => StatusCode::NOT_FOUND,
        crate::SyncError::UnknownProvider(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics_text() -> impl IntoResponse {
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        metrics::encode_metrics(),
    )
}

async fn enqueue_sync(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EnqueueSyncRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let provider: Provider = req
        .provider
        .parse()
        .map_err(|e: crate::SyncError| error_response(StatusCode::BAD_REQUEST, e.to_string()))?;

    let priority = match req.priority.as_deref() {
        Some("high") => Priority::High,
        Some("normal") | None => Priority::Normal,
        Some(other) => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                format!("Invalid priority: {}", other),
            ));
        }
    };

    let job_id = state
        .service
        .enqueue_sync(InvoiceId::new(req.invoice_id), provider, priority)
        .map_err(enqueue_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueSyncResponse {
            job_id: job_id.to_string(),
        }),
    ))
}

async fn sync_status(
    State(state): State<Arc<AppState>>,
    Path(invoice_id): Path<String>,
) -> Result<Json<SyncStatusReport>, (StatusCode, Json<ErrorResponse>)> {
    let report = state
        .service
        .sync_status(&InvoiceId::new(invoice_id))
        .map_err(|e| {
            let status = match &e {
                crate::SyncError::InvoiceNotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, e.to_string())
        })?;
    Ok(Json(report))
}

async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let provider: Provider = provider
        .parse()
        .map_err(|e: crate::SyncError| error_response(StatusCode::NOT_FOUND, e.to_string()))?;

    // Authenticity first: an unverifiable payload is a 401 the provider
    // will not retry
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if !state.verifier.verify(provider, &body, signature) {
        tracing::warn!(provider = %provider, "Webhook signature verification failed");
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "Signature verification failed",
        ));
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", e)))?;

    // 2xx only after the event is durably queued; 5xx hands the retry
    // back to the provider
    match state.service.ingest_webhook(provider, payload) {
        Ok(event_id) => Ok((
            StatusCode::ACCEPTED,
            Json(WebhookAcceptedResponse {
                event_id: event_id.to_string(),
            }),
        )),
        Err(crate::SyncError::InvalidWebhook(message)) => {
            Err(error_response(StatusCode::BAD_REQUEST, message))
        }
        Err(crate::SyncError::WebhookQueueFull { .. }) => Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Webhook queue full, retry later",
        )),
        Err(e) => Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            e.to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use crate::config::SyncConfig;
    use crate::model::InvoiceSnapshot;
    use crate::provider::{MockProviderClient, ProviderRegistry};
    use crate::store::{MemoryStore, Store};
    use crate::webhook::AllowAllVerifier;
    use chrono::Utc;
    use tower::ServiceExt;

    fn test_service() -> Arc<SyncService> {
        let store = Arc::new(MemoryStore::new());
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(MockProviderClient::new(Provider::QuickBooks)));

        store
            .upsert_snapshot(&InvoiceSnapshot {
                invoice_id: InvoiceId::new("inv-1"),
                organization_id: "org-1".to_string(),
                invoice_number: "INV-1".to_string(),
                customer_name: "Acme Restoration".to_string(),
                total_cents: 10_000,
                currency: "USD".to_string(),
                issued_at: Utc::now(),
                memo: None,
            })
            .unwrap();

        Arc::new(SyncService::new(
            SyncConfig::default(),
            store,
            providers,
            system_clock(),
        ))
    }

    fn router(service: Arc<SyncService>) -> Router {
        SyncServer::new(service, Arc::new(AllowAllVerifier)).test_router()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = router(test_service())
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_enqueue_then_conflict() {
        let service = test_service();

        let request = |uri: &str| {
            axum::http::Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    r#"{"invoice_id": "inv-1", "provider": "quickbooks"}"#,
                ))
                .unwrap()
        };

        let response = router(service.clone()).oneshot(request("/sync")).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert!(body["job_id"].as_str().unwrap().starts_with("sj-"));

        // Same invoice while pending: 409
        let response = router(service).oneshot(request("/sync")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_status_query() {
        let service = test_service();
        service
            .enqueue_sync(InvoiceId::new("inv-1"), Provider::QuickBooks, Priority::Normal)
            .unwrap();

        let response = router(service)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/sync/inv-1")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "pending");
        assert_eq!(body["provider"], "quickbooks");
    }

    #[tokio::test]
    async fn test_status_unknown_invoice_404() {
        let response = router(test_service())
            .oneshot(
                axum::http::Request::builder()
                    .uri("/sync/inv-404")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_webhook_receipt_and_rejections() {
        let service = test_service();

        let webhook = |provider: &str, body: &str| {
            axum::http::Request::builder()
                .method("POST")
                .uri(format!("/webhooks/{}", provider))
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body.to_string()))
                .unwrap()
        };

        let payload = r#"{"event_id": "evt-1", "type": "payment.received",
            "invoice_external_id": "qb-1", "payment_id": "pay-1", "amount_cents": 100}"#;

        let response = router(service.clone())
            .oneshot(webhook("quickbooks", payload))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["event_id"], "quickbooks:evt-1");

        // Unknown provider code: 404, provider will not retry
        let response = router(service.clone())
            .oneshot(webhook("freshbooks", payload))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Payload without an event_id cannot be keyed: 400
        let response = router(service)
            .oneshot(webhook("quickbooks", r#"{"type": "payment.received"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_webhook_signature_rejection() {
        let service = test_service();
        let verifier = Arc::new(crate::webhook::SharedSecretVerifier::new(
            [(Provider::QuickBooks, "hush".to_string())].into_iter().collect(),
        ));
        let router = SyncServer::new(service, verifier).test_router();

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/webhooks/quickbooks")
            .header("content-type", "application/json")
            .header("x-webhook-signature", "wrong")
            .body(axum::body::Body::from("{}"))
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
