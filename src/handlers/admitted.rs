//! Fallback handler for every admitted route without a dedicated handler.
//!
//! It echoes what admission decided. For `POST`, `PUT` and `DELETE` it first
//! runs the idempotency guard with the caller's `X-Parse-Request-Id`, the
//! way a mutating handler must before doing any work.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, Uri};
use axum::{Extension, Json};
use tracing::{debug, instrument};

use crate::auth::AuthContext;
use crate::credentials::CredentialBundle;
use crate::error::AdmissionResult;
use crate::idempotency::REQUEST_ID_HEADER;
use crate::middleware::ClientIp;
use crate::models::AdmittedResponse;
use crate::registry::AppConfig;
use crate::state::AppState;

fn is_mutating(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::DELETE)
}

#[instrument(skip_all, fields(app_id = %app.app_id, method = %method, path = %uri.path()))]
pub async fn admitted(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Extension(auth): Extension<AuthContext>,
    Extension(app): Extension<Arc<AppConfig>>,
    Extension(credentials): Extension<CredentialBundle>,
    Extension(client_ip): Extension<ClientIp>,
    body: Bytes,
) -> AdmissionResult<Json<AdmittedResponse>> {
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if is_mutating(&method) {
        state
            .idempotency
            .ensure(request_id.as_deref(), uri.path(), &app)
            .await?;
    }

    debug!(tier = auth.tier_name(), body_bytes = body.len(), "Echoing admitted request");

    Ok(Json(AdmittedResponse {
        app_id: credentials.app_id,
        auth,
        method: method.to_string(),
        path: uri.path().to_string(),
        client_ip: client_ip.0,
        client_sdk: credentials.client_sdk,
        request_id,
        body_bytes: body.len(),
    }))
}
