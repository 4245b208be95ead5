use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::auth::AuthContext;
use crate::credentials::ClientSdk;

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Service health status
    pub status: String,
    /// Service version
    pub version: String,
    /// Applications currently registered
    pub registered_apps: usize,
    pub uptime_seconds: u64,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

/// Master-only server description.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfoResponse {
    pub parse_server_version: String,
    pub app_id: String,
    pub read_only: bool,
    pub rate_limit_rules: usize,
    pub idempotency_enabled: bool,
}

/// What admission decided for a request, as seen by a downstream handler.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmittedResponse {
    pub app_id: String,
    pub auth: AuthContext,
    pub method: String,
    pub path: String,
    pub client_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_sdk: Option<ClientSdk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Body length after admission stripped credential fields
    pub body_bytes: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::auth::Identity;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            version: "0.1.0".to_string(),
            registered_apps: 2,
            uptime_seconds: 10,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&response).expect("Serialization should succeed");
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(json.contains("\"registeredApps\":2"));
    }

    #[test]
    fn test_admitted_response_flattens_tier() {
        let response = AdmittedResponse {
            app_id: "app".to_string(),
            auth: AuthContext::user(Identity::new("u1"), Some("inst".to_string())),
            method: "POST".to_string(),
            path: "/classes/Foo".to_string(),
            client_ip: "10.0.0.1".to_string(),
            client_sdk: None,
            request_id: None,
            body_bytes: 0,
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["auth"]["tier"], "user");
        assert_eq!(json["auth"]["user"]["userId"], "u1");
        assert!(json.get("clientSdk").is_none());
    }
}
