//! # Parse Gate
//!
//! Request admission control for a multi-tenant Parse-style backend API,
//! built on Axum. Every request is resolved to an application, assigned
//! exactly one privilege tier, and checked against per-application rate
//! limits before any handler runs:
//!
//! - **Credentials**: headers, JSON body fields, or HTTP Basic auth
//! - **Privileges**: maintenance, master, read-only master, user, anonymous
//! - **Rate limits**: per-app rules keyed by IP, user, session, or globally
//! - **Idempotency**: duplicate `X-Parse-Request-Id` detection for handlers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (Trace → CORS → AdmissionLayer)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  AdmissionPipeline                                          │
//! │    credentials → registry → auth::classify → session        │
//! │    → RateLimiter                                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, serverInfo, admitted + IdempotencyGuard) │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Collaborators: AppRegistry, SessionResolver,               │
//! │                 CountingStore, RecordStore                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use parse_gate::{AppState, Bootstrap, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let bootstrap = Bootstrap::parse(r#"{"apps": [{"appId": "app", "masterKey": "m"}]}"#)?;
//!     let state = AppState::new(config, bootstrap)?;
//!     let app = build_router(state);
//!
//!     // Start the server...
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod handlers;
pub mod idempotency;
pub mod ip_policy;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod rate_limit;
pub mod registry;
pub mod routes;
pub mod session;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use auth::{AuthContext, Identity, Tier};
pub use config::Config;
pub use error::{AdmissionError, AdmissionResult};
pub use pipeline::AdmissionPipeline;
pub use registry::{AppConfig, AppDefinition, AppRegistry, Bootstrap, InMemoryAppRegistry};
pub use routes::build_router;
pub use state::AppState;
