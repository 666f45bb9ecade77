//! HTTP gateway: validates inbound signatures, runs them through the store,
//! and serializes the consolidated view.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use idr_core::{ConsolidatedView, ReconcileError, Signature, now_unix_millis};
use idr_store::Store;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

const SERVICE_NAME: &str = "Identity Reconciliation Service";
const UNAVAILABLE: &str = "Service temporarily unavailable. Please try again later.";

#[derive(Clone)]
pub struct AppState {
    store: Arc<Mutex<Store>>,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    /// Flush the WAL. Called once the listener has drained.
    pub async fn checkpoint_wal(&self) {
        let store = self.store.lock().await;
        match store.checkpoint_truncate() {
            Ok(()) => tracing::info!("WAL checkpoint complete"),
            Err(e) => tracing::warn!("WAL checkpoint failed: {e}"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IdentifyResponse {
    pub contact: ConsolidatedView,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub timestamp: String,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, UNAVAILABLE.to_string()),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/identify", post(identify))
        .route("/api/v1/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled, then let in-flight requests finish.
pub async fn run(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn identify(
    State(state): State<AppState>,
    payload: Result<Json<Signature>, JsonRejection>,
) -> Result<Json<IdentifyResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        tracing::warn!("malformed identify request: {rejection}");
        ApiError::BadRequest(rejection.body_text())
    })?;
    let signature = request.validate().map_err(|e| {
        tracing::warn!("rejected identify request: {e}");
        ApiError::BadRequest(e.to_string())
    })?;
    tracing::debug!(
        "identify request: email={:?} phone={:?}",
        signature.email,
        signature.phone_number
    );

    let mut store = state.store.lock().await;
    match store.reconcile(&signature) {
        Ok(outcome) => Ok(Json(IdentifyResponse {
            contact: outcome.view,
        })),
        Err(ReconcileError::Rejected(e)) => Err(ApiError::BadRequest(e.to_string())),
        Err(ReconcileError::Invariant(v)) => {
            tracing::error!(
                "invariant violation reconciling email={:?} phone={:?}: {v}",
                signature.email,
                signature.phone_number
            );
            Err(ApiError::Unavailable)
        }
        Err(ReconcileError::Store(e)) => {
            if e.is_transient() {
                tracing::warn!("store busy, reconciliation rolled back: {e}");
            } else {
                tracing::error!("store failure, reconciliation rolled back: {e}");
            }
            Err(ApiError::Unavailable)
        }
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP".to_string(),
        service: SERVICE_NAME.to_string(),
        timestamp: now_unix_millis().to_string(),
    })
}
