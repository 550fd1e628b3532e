//! HTTP API for health checks, Prometheus metrics and manual inventory refresh

use autoscale_core::{
    health::{ComponentStatus, HealthRegistry},
    observability::AutoscaleMetrics,
    ServiceRefresh,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: AutoscaleMetrics,
    /// Absent until the autoscaler is running
    pub refresher: Option<Arc<dyn ServiceRefresh>>,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, metrics: AutoscaleMetrics) -> Self {
        Self {
            health_registry,
            metrics,
            refresher: None,
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn ServiceRefresh>) -> Self {
        self.refresher = Some(refresher);
        self
    }
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_services: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Health check response - returns 200 if healthy, 503 if degraded/unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Re-read the service inventory now instead of waiting for the next period
async fn refresh_services(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let refresher = match &state.refresher {
        Some(refresher) => refresher,
        None => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(RefreshResponse {
                    scheduled_services: None,
                    error: Some("Autoscaler not yet initialized".to_string()),
                }),
            )
        }
    };

    match refresher.refresh_services().await {
        Ok(scheduled) => {
            info!(scheduled, "Manual service refresh completed");
            (
                StatusCode::OK,
                Json(RefreshResponse {
                    scheduled_services: Some(scheduled),
                    error: None,
                }),
            )
        }
        Err(e) => {
            error!(error = %e, "Manual service refresh failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(RefreshResponse {
                    scheduled_services: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/services/refresh", post(refresh_services))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
