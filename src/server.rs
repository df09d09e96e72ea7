//! Loopback HTTP server for receiving activity from editor integrations.
//!
//! This module provides an HTTP server that:
//! - Accepts activity events via POST /activity (one event or an array)
//! - Hands them to the producer loop over the same channel the stdin source uses
//! - Reports delivery status via GET /status
//!
//! # Architecture
//!
//! ```text
//! Editor plugin ──→ POST /activity ──→ channel ──→ recorder ──→ queue ──→ dispatcher
//! ```

use crate::activity::ActivityEvent;
use crate::queue::SharedQueue;
use crate::status::{DeliveryStatus, SharedStats, SharedStatusHandle, StatsSnapshot};
use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    routing::{get, post},
    Json, Router,
};
use crossbeam_channel::{Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind to on 127.0.0.1 (0 for random)
    pub port: u16,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

/// Shared server state
pub struct ServerState {
    /// Producer side of the activity channel
    events: Sender<ActivityEvent>,
    status: SharedStatusHandle,
    stats: SharedStats,
    queue: SharedQueue,
}

impl ServerState {
    pub fn new(
        events: Sender<ActivityEvent>,
        status: SharedStatusHandle,
        stats: SharedStats,
        queue: SharedQueue,
    ) -> Self {
        Self {
            events,
            status,
            stats,
            queue,
        }
    }
}

/// Body of POST /activity
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ActivityPayload {
    Many(Vec<ActivityEvent>),
    One(ActivityEvent),
}

impl ActivityPayload {
    fn into_events(self) -> Vec<ActivityEvent> {
        match self {
            ActivityPayload::Many(events) => events,
            ActivityPayload::One(event) => vec![event],
        }
    }
}

/// Response from the activity endpoint
#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub status: String,
    pub accepted: usize,
}

/// Response from the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub delivery: DeliveryStatus,
    pub summary: String,
    pub pending: usize,
    pub stats: StatsSnapshot,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// POST /activity
///
/// Events are accepted without waiting for debouncing or delivery. Events
/// without a file path are accepted here and dropped by the debouncer.
async fn activity(
    State(state): State<Arc<ServerState>>,
    Json(payload): Json<ActivityPayload>,
) -> Result<Json<IngestResponse>, (StatusCode, Json<ErrorResponse>)> {
    let mut accepted = 0;
    for event in payload.into_events() {
        match state.events.try_send(event) {
            Ok(()) => accepted += 1,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(accepted, "activity channel full, rejecting remaining events");
                return Err((
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(ErrorResponse {
                        error: format!("Activity backlog full after {accepted} events"),
                        code: "BACKLOG_FULL".to_string(),
                    }),
                ));
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err((
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(ErrorResponse {
                        error: "Agent is shutting down".to_string(),
                        code: "SHUTTING_DOWN".to_string(),
                    }),
                ));
            }
        }
    }

    Ok(Json(IngestResponse {
        status: "ok".to_string(),
        accepted,
    }))
}

/// GET /status
async fn status(State(state): State<Arc<ServerState>>) -> Json<StatusResponse> {
    let mut delivery = state.status.current();
    delivery.pending = state.queue.len();
    Json(StatusResponse {
        summary: delivery.to_string(),
        pending: delivery.pending,
        delivery,
        stats: state.stats.snapshot(),
    })
}

/// Router with all activity endpoints.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/activity", post(activity))
        .route("/status", get(status))
        .layer(
            CorsLayer::new()
                .allow_origin([
                    HeaderValue::from_static("http://localhost"),
                    HeaderValue::from_static("http://127.0.0.1"),
                    // Editor webviews
                    HeaderValue::from_static("vscode-webview://"),
                ])
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server on 127.0.0.1.
pub async fn run(
    config: ServerConfig,
    state: ServerState,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = router(Arc::new(state));

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("activity server listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("server shutdown signal received");
            })
            .await
        {
            tracing::error!("server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
