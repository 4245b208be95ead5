use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Numeric error codes carried in the `code` field of error envelopes.
///
/// These are the codes the Parse client SDKs branch on, so they are part of
/// the wire contract and must not be renumbered.
pub mod codes {
    pub const INTERNAL_SERVER_ERROR: i32 = 1;
    pub const CONNECTION_FAILED: i32 = 100;
    pub const OBJECT_NOT_FOUND: i32 = 101;
    pub const INVALID_JSON: i32 = 107;
    pub const DUPLICATE_VALUE: i32 = 137;
    pub const DUPLICATE_REQUEST: i32 = 159;
    pub const INVALID_SESSION_TOKEN: i32 = 209;
}

/// Every way admission (or an admission-adjacent check run by a handler) can fail.
///
/// Callers branch on the variant, never on the message. The HTTP rendering
/// lives in the [`IntoResponse`] impl below so the pipeline, the middleware and
/// the handlers all produce identical envelopes.
///
/// # Client vs. Server Errors
///
/// - Credential, IP and key problems are decided locally and map to 4xx.
/// - Collaborator failures (session store, counting store, record store) map
///   to 5xx and never expose their detail to the client.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// `X-Parse-Cloud-Context` or a body `_context` was not a JSON object.
    #[error("Invalid object for context.")]
    MalformedContext,

    /// A body declared as JSON could not be parsed.
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    /// Credentials could not be resolved to an application or did not match
    /// its keys. The reason is for logs only; clients see `unauthorized`.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The request body exceeded the configured limit or could not be read.
    #[error("request entity too large")]
    PayloadTooLarge,

    /// A valid credential used outside its permitted scope.
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    InvalidSessionToken(String),

    #[error("{0}")]
    ObjectNotFound(String),

    #[error("Duplicate request")]
    DuplicateRequest,

    /// A rate-limit rule was violated; carries the rule's message.
    #[error("{0}")]
    RateLimited(String),

    /// A counting store failed for a reason other than a limit violation.
    #[error("Rate limit store unavailable: {0}")]
    LimiterUnavailable(String),

    #[error("Invalid server state: {0}")]
    InvalidServerState(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Error envelope written to clients.
///
/// Matches the shapes the Parse SDKs expect: `{"error": ...}` for
/// authorization failures and `{"code": n, "error": ...}` otherwise.
#[derive(Debug, Serialize)]
struct ErrorBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<i32>,
    error: String,
}

impl AdmissionError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            AdmissionError::MalformedContext
            | AdmissionError::InvalidJson(_)
            | AdmissionError::InvalidSessionToken(_)
            | AdmissionError::DuplicateRequest => StatusCode::BAD_REQUEST,
            AdmissionError::InvalidRequest(_) | AdmissionError::Unauthorized(_) => {
                StatusCode::FORBIDDEN
            }
            AdmissionError::ObjectNotFound(_) => StatusCode::NOT_FOUND,
            AdmissionError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AdmissionError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AdmissionError::LimiterUnavailable(_) => StatusCode::BAD_GATEWAY,
            AdmissionError::InvalidServerState(_) | AdmissionError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Parse error code for the envelope, `None` for the bare `{"error":...}` shape.
    pub fn code(&self) -> Option<i32> {
        match self {
            AdmissionError::InvalidRequest(_)
            | AdmissionError::Unauthorized(_)
            | AdmissionError::PayloadTooLarge => None,
            AdmissionError::MalformedContext | AdmissionError::InvalidJson(_) => {
                Some(codes::INVALID_JSON)
            }
            AdmissionError::InvalidSessionToken(_) => Some(codes::INVALID_SESSION_TOKEN),
            AdmissionError::ObjectNotFound(_) => Some(codes::OBJECT_NOT_FOUND),
            AdmissionError::DuplicateRequest => Some(codes::DUPLICATE_REQUEST),
            AdmissionError::RateLimited(_) => Some(codes::CONNECTION_FAILED),
            AdmissionError::LimiterUnavailable(_)
            | AdmissionError::InvalidServerState(_)
            | AdmissionError::Internal(_) => Some(codes::INTERNAL_SERVER_ERROR),
        }
    }

    /// Short, stable label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::MalformedContext => "malformed_context",
            AdmissionError::InvalidJson(_) => "invalid_json",
            AdmissionError::InvalidRequest(_) => "invalid_request",
            AdmissionError::Unauthorized(_) => "unauthorized",
            AdmissionError::PayloadTooLarge => "payload_too_large",
            AdmissionError::InvalidSessionToken(_) => "invalid_session_token",
            AdmissionError::ObjectNotFound(_) => "object_not_found",
            AdmissionError::DuplicateRequest => "duplicate_request",
            AdmissionError::RateLimited(_) => "rate_limited",
            AdmissionError::LimiterUnavailable(_) => "limiter_unavailable",
            AdmissionError::InvalidServerState(_) => "invalid_server_state",
            AdmissionError::Internal(_) => "internal",
        }
    }

    /// Client-facing message. Internal detail is replaced with a generic text.
    fn public_message(&self) -> String {
        match self {
            AdmissionError::InvalidRequest(_) => "unauthorized".to_string(),
            AdmissionError::InvalidJson(_) => "Invalid JSON".to_string(),
            AdmissionError::LimiterUnavailable(_) => "Rate limiter unavailable.".to_string(),
            AdmissionError::Internal(_) => "Internal server error.".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        // Full detail stays server-side
        match &self {
            AdmissionError::Internal(_) | AdmissionError::LimiterUnavailable(_) => {
                tracing::error!(error = %self, "Request failed");
            }
            AdmissionError::InvalidServerState(_) => {
                tracing::warn!(error = %self, "Request against app in bad state");
            }
            _ => tracing::debug!(error = %self, reason = self.reason(), "Request rejected"),
        }

        let body = ErrorBody {
            code: self.code(),
            error: self.public_message(),
        };

        (self.status(), axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results with AdmissionError.
pub type AdmissionResult<T> = Result<T, AdmissionError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn render(err: AdmissionError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_invalid_request_hides_reason() {
        let (status, body) = render(AdmissionError::InvalidRequest("no app id".into())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, serde_json::json!({"error": "unauthorized"}));
    }

    #[tokio::test]
    async fn test_malformed_context_envelope() {
        let (status, body) = render(AdmissionError::MalformedContext).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            serde_json::json!({"code": 107, "error": "Invalid object for context."})
        );
    }

    #[tokio::test]
    async fn test_rate_limited_carries_rule_message() {
        let (status, body) = render(AdmissionError::RateLimited("slow down".into())).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body, serde_json::json!({"code": 100, "error": "slow down"}));
    }

    #[tokio::test]
    async fn test_internal_error_does_not_leak_detail() {
        let (status, body) =
            render(AdmissionError::Internal("mongo at 10.1.2.3 refused".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], 1);
        assert!(!body["error"].as_str().unwrap().contains("10.1.2.3"));
    }

    #[tokio::test]
    async fn test_invalid_server_state_message() {
        let (status, body) =
            render(AdmissionError::InvalidServerState("initialized".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Invalid server state: initialized");
    }

    #[test]
    fn test_duplicate_request_code() {
        let err = AdmissionError::DuplicateRequest;
        assert_eq!(err.code(), Some(codes::DUPLICATE_REQUEST));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
