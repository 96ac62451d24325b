// ============================================================================
// Health and Metrics Endpoint
// ============================================================================
//
// Endpoints:
// - GET /health  - 200 while the broker connection is Connected, 503 otherwise
// - GET /metrics - Prometheus metrics
//
// ============================================================================

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::broker::{BrokerConnectionManager, ConnectionState};

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    broker: String,
    node: Option<String>,
}

pub fn router(manager: Arc<BrokerConnectionManager>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .with_state(manager)
}

/// GET /health
pub async fn health_check(State(manager): State<Arc<BrokerConnectionManager>>) -> impl IntoResponse {
    let state = manager.state();
    let (code, status) = if state == ConnectionState::Connected {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };

    (
        code,
        Json(HealthBody {
            status,
            broker: state.to_string(),
            node: manager.active_node(),
        }),
    )
}

/// GET /metrics
pub async fn metrics() -> impl IntoResponse {
    match dispatch_metrics::gather_metrics() {
        Ok(metrics_data) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; version=0.0.4")],
            metrics_data,
        ),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("Content-Type", "text/plain")],
                "Internal Server Error".to_string(),
            )
        }
    }
}

/// Serve the health router until `shutdown` is cancelled.
pub async fn serve(port: u16, manager: Arc<BrokerConnectionManager>, shutdown: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind health endpoint on {}", addr))?;

    info!("Health and metrics endpoint listening on {}", addr);

    axum::serve(listener, router(manager))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Health endpoint failed")?;
    Ok(())
}
