//! Health endpoint.
//!
//! `GET /health` sits outside admission: it needs no application id and is
//! never rate limited, so load balancers can probe it freely.

use axum::Json;
use axum::extract::State;
use chrono::Utc;
use tracing::instrument;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint.
///
/// Always returns 200 OK.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "registeredApps": 2,
///   "uptimeSeconds": 3600,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        registered_apps: state.registry.len(),
        uptime_seconds: state.uptime_seconds(),
        timestamp: Utc::now(),
    })
}
