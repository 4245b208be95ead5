use std::sync::Arc;

use axum::{Extension, Json};
use tracing::instrument;

use crate::auth::{AuthContext, require_master};
use crate::error::AdmissionResult;
use crate::models::ServerInfoResponse;
use crate::registry::AppConfig;

/// `GET /serverInfo`, master key only.
#[instrument(skip_all, fields(app_id = %app.app_id))]
pub async fn server_info(
    Extension(auth): Extension<AuthContext>,
    Extension(app): Extension<Arc<AppConfig>>,
) -> AdmissionResult<Json<ServerInfoResponse>> {
    require_master(&auth)?;

    Ok(Json(ServerInfoResponse {
        parse_server_version: env!("CARGO_PKG_VERSION").to_string(),
        app_id: app.app_id.clone(),
        read_only: auth.is_read_only(),
        rate_limit_rules: app.rate_limits.len(),
        idempotency_enabled: app.idempotency.is_some(),
    }))
}
