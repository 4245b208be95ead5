//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │ ← answers preflights before admission
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │    Admission     │ ← 400/403/404/413/429/5xx (bypassed for /health)
//! └────────┬─────────┘
//!          │
//!          ▼
//!      Handler
//! ```
//!
//! # Route Groups
//!
//! - `/health` - Liveness (no admission)
//! - `/serverInfo` - Master key only
//! - everything else - admitted, then echoed by the fallback handler

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, HeaderValue, Method};
use axum::routing::get;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::handlers;
use crate::middleware::AdmissionLayer;
use crate::state::AppState;

/// Request headers every client may send cross-origin.
pub const DEFAULT_ALLOWED_HEADERS: &[&str] = &[
    "x-parse-master-key",
    "x-parse-rest-api-key",
    "x-parse-javascript-key",
    "x-parse-application-id",
    "x-parse-client-version",
    "x-parse-session-token",
    "x-requested-with",
    "x-parse-revocable-session",
    "x-parse-request-id",
    "content-type",
    "pragma",
    "cache-control",
];

/// Response headers exposed to cross-origin callers.
pub const EXPOSED_HEADERS: &[&str] = &["x-parse-job-status-id", "x-parse-push-status-id"];

/// Build the application router with all routes and middleware configured.
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;

    let admission = AdmissionLayer::new(
        state.pipeline.clone(),
        state.trusted_proxies.clone(),
        config.max_request_body_size,
    );

    // =========================================================================
    // Admitted routes
    // =========================================================================
    let api = Router::new()
        .route("/serverInfo", get(handlers::server_info))
        .fallback(handlers::admitted)
        .layer(admission);

    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .merge(api);

    // =========================================================================
    // Outer middleware (last added runs first)
    // =========================================================================
    info!(
        max_size_mb = config.max_request_body_size / (1024 * 1024),
        "Request body size limit configured"
    );
    router = router.layer(DefaultBodyLimit::max(config.max_request_body_size));
    router = router.layer(build_cors_layer(config));
    router = router.layer(TraceLayer::new_for_http());

    router.with_state(state)
}

/// Build the CORS layer from the configured origins and extra headers.
///
/// Unparseable entries are skipped with a warning; `Config::validate`
/// rejects bad header names up front.
fn build_cors_layer(config: &Config) -> CorsLayer {
    let headers: Vec<HeaderName> = DEFAULT_ALLOWED_HEADERS
        .iter()
        .copied()
        .chain(config.cors_allow_headers.iter().map(String::as_str))
        .filter_map(|h| HeaderName::from_bytes(h.as_bytes()).ok())
        .collect();

    let exposed: Vec<HeaderName> = EXPOSED_HEADERS
        .iter()
        .map(|h| HeaderName::from_static(h))
        .collect();

    let origin = if config.cors_allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_allowed_origins
            .iter()
            .filter_map(|o| match o.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = %o, "Ignoring unparseable CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([
            Method::GET,
            Method::PUT,
            Method::POST,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(headers)
        .expose_headers(exposed)
}
