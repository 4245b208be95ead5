//! End-to-end admission tests.
//!
//! Each test builds the full router in-process and drives it with
//! `tower::ServiceExt::oneshot`. No listener is bound, so there is no peer
//! address and `X-Forwarded-For` selects the client IP.
//!
//! Run with: `cargo test --test admission_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use parse_gate::{AppState, Bootstrap, Config, build_router};

const APP_ID: &str = "app";
const MASTER_KEY: &str = "master";
const JS_KEY: &str = "js";

fn default_app() -> Value {
    json!({
        "appId": APP_ID,
        "masterKey": MASTER_KEY,
        "javascriptKey": JS_KEY,
        "masterKeyIps": ["10.0.0.1/32"]
    })
}

fn router_with(config: Config, apps: Vec<Value>) -> Router {
    let bootstrap = json!({
        "apps": apps,
        "sessions": [{"token": "r:valid", "userId": "u1"}]
    });
    let bootstrap = Bootstrap::parse(&bootstrap.to_string()).unwrap();
    build_router(AppState::new(config, bootstrap).unwrap())
}

fn router(apps: Vec<Value>) -> Router {
    router_with(Config::default(), apps)
}

/// Request builder pre-filled with the app id, a client key and a client IP.
fn client(method: Method, uri: &str, ip: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", ip)
        .header("x-parse-application-id", APP_ID)
        .header("x-parse-javascript-key", JS_KEY)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

// =============================================================================
// Routing
// =============================================================================

#[tokio::test]
async fn test_health_bypasses_admission() {
    let app = router(vec![default_app()]);
    let req = Request::get("/health").body(Body::empty()).unwrap();

    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["registeredApps"], 1);
}

#[tokio::test]
async fn test_cors_preflight_answered_before_admission() {
    let app = router(vec![default_app()]);
    let req = Request::builder()
        .method(Method::OPTIONS)
        .uri("/classes/Foo")
        .header("origin", "https://example.com")
        .header("access-control-request-method", "POST")
        .header("access-control-request-headers", "x-parse-application-id")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "*"
    );
}

// =============================================================================
// Application resolution
// =============================================================================

#[tokio::test]
async fn test_missing_app_id_is_unauthorized() {
    let app = router(vec![default_app()]);
    let req = Request::get("/classes/Foo").body(Body::empty()).unwrap();

    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, json!({"error": "unauthorized"}));
}

#[tokio::test]
async fn test_unknown_app_id_is_unauthorized() {
    let app = router(vec![default_app()]);
    let req = Request::get("/classes/Foo")
        .header("x-parse-application-id", "nope")
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, json!({"error": "unauthorized"}));
}

#[tokio::test]
async fn test_wrong_client_key_is_unauthorized() {
    let app = router(vec![default_app()]);
    let req = Request::get("/classes/Foo")
        .header("x-parse-application-id", APP_ID)
        .header("x-parse-javascript-key", "wrong")
        .body(Body::empty())
        .unwrap();

    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_body_credentials_are_stripped() {
    let app = router(vec![default_app()]);
    let req = Request::post("/classes/Foo")
        .header("content-type", "text/plain")
        .header("x-forwarded-for", "203.0.113.9")
        .body(Body::from(
            json!({"_ApplicationId": APP_ID, "_JavaScriptKey": JS_KEY, "foo": 1}).to_string(),
        ))
        .unwrap();

    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["appId"], APP_ID);
    assert_eq!(body["auth"]["tier"], "anonymous");
    // Only {"foo":1} reaches the handler
    assert_eq!(body["bodyBytes"], 9);
}

#[tokio::test]
async fn test_unhealthy_app_state_is_rejected() {
    let app = router(vec![json!({
        "appId": APP_ID,
        "masterKey": MASTER_KEY,
        "state": "initialized"
    })]);
    let req = client(Method::GET, "/classes/Foo", "203.0.113.9")
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body,
        json!({"code": 1, "error": "Invalid server state: initialized"})
    );
}

// =============================================================================
// Privileges
// =============================================================================

#[tokio::test]
async fn test_master_key_from_disallowed_ip_is_rejected() {
    let app = router(vec![default_app()]);
    let req = client(Method::GET, "/classes/Foo", "10.0.0.5")
        .header("x-parse-master-key", MASTER_KEY)
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, json!({"error": "unauthorized"}));
}

#[tokio::test]
async fn test_master_key_with_prepended_forwarded_ip_is_rejected() {
    let app = router(vec![default_app()]);
    let req = client(Method::GET, "/classes/Foo", "10.0.0.1, 203.0.113.5")
        .header("x-parse-master-key", MASTER_KEY)
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, json!({"error": "unauthorized"}));
}

#[tokio::test]
async fn test_master_key_from_allowed_ip() {
    let app = router(vec![default_app()]);
    let req = client(Method::GET, "/classes/Foo", "10.0.0.1")
        .header("x-parse-master-key", MASTER_KEY)
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["auth"]["tier"], "master");
    assert_eq!(body["auth"]["readOnly"], false);
    assert_eq!(body["clientIp"], "10.0.0.1");
}

#[tokio::test]
async fn test_server_info_requires_master() {
    let app = router(vec![default_app()]);

    let req = client(Method::GET, "/serverInfo", "203.0.113.9")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, json!({"error": "unauthorized: master key is required"}));

    let req = client(Method::GET, "/serverInfo", "10.0.0.1")
        .header("x-parse-master-key", MASTER_KEY)
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["appId"], APP_ID);
}

#[tokio::test]
async fn test_session_token_resolves_user() {
    let app = router(vec![default_app()]);
    let req = client(Method::GET, "/classes/Foo", "203.0.113.9")
        .header("x-parse-session-token", "r:valid")
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["auth"]["tier"], "user");
    assert_eq!(body["auth"]["user"]["userId"], "u1");
}

#[tokio::test]
async fn test_unknown_session_token_is_rejected() {
    let app = router(vec![default_app()]);
    let req = client(Method::GET, "/classes/Foo", "203.0.113.9")
        .header("x-parse-session-token", "r:unknown")
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 209);
}

// =============================================================================
// Request shape
// =============================================================================

#[tokio::test]
async fn test_cloud_context_must_be_object() {
    let app = router(vec![default_app()]);

    let req = client(Method::GET, "/classes/Foo", "203.0.113.9")
        .header("x-parse-cloud-context", r#"{"a":1}"#)
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);

    let req = client(Method::GET, "/classes/Foo", "203.0.113.9")
        .header("x-parse-cloud-context", "[1,2]")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"code": 107, "error": "Invalid object for context."}));
}

#[tokio::test]
async fn test_method_override() {
    let app = router(vec![default_app()]);
    let req = client(Method::POST, "/classes/Foo", "203.0.113.9")
        .header("content-type", "application/json")
        .body(Body::from(json!({"_method": "GET", "where": {}}).to_string()))
        .unwrap();

    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["method"], "GET");
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let config = Config {
        max_request_body_size: 16,
        ..Default::default()
    };
    let app = router_with(config, vec![default_app()]);
    let req = client(Method::POST, "/classes/Foo", "203.0.113.9")
        .header("content-type", "application/json")
        .body(Body::from(json!({"payload": "x".repeat(64)}).to_string()))
        .unwrap();

    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_invalid_json_body_is_rejected() {
    let app = router(vec![default_app()]);
    let req = client(Method::POST, "/classes/Foo", "203.0.113.9")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 107);
}

// =============================================================================
// Rate limiting
// =============================================================================

fn rate_limited_app() -> Value {
    let mut app = default_app();
    app["rateLimit"] = json!([{
        "requestPath": "/classes/*",
        "requestTimeWindow": 60000,
        "requestCount": 1
    }]);
    app
}

#[tokio::test]
async fn test_ip_rate_limit_per_address() {
    let app = router(vec![rate_limited_app()]);
    let get = |ip: &str| {
        client(Method::GET, "/classes/Foo", ip)
            .body(Body::empty())
            .unwrap()
    };

    let (status, _) = send(&app, get("203.0.113.1")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, get("203.0.113.1")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body, json!({"code": 100, "error": "Too many requests."}));

    let (status, _) = send(&app, get("203.0.113.2")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limit_ignores_other_paths() {
    let app = router(vec![rate_limited_app()]);
    for _ in 0..3 {
        let req = client(Method::GET, "/functions/hello", "203.0.113.1")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn test_master_key_skips_rate_limit() {
    let mut definition = rate_limited_app();
    definition["masterKeyIps"] = json!(["0.0.0.0/0"]);
    let app = router(vec![definition]);

    for _ in 0..3 {
        let req = client(Method::GET, "/classes/Foo", "203.0.113.1")
            .header("x-parse-master-key", MASTER_KEY)
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
    }
}

// =============================================================================
// Idempotency
// =============================================================================

fn idempotent_app() -> Value {
    let mut app = default_app();
    app["idempotencyOptions"] = json!({"paths": ["classes/.*"], "ttl": 60});
    app
}

#[tokio::test]
async fn test_duplicate_request_id_is_rejected() {
    let app = router(vec![idempotent_app()]);
    let post = |request_id: &str| {
        client(Method::POST, "/classes/Foo", "203.0.113.9")
            .header("x-parse-request-id", request_id)
            .header("content-type", "application/json")
            .body(Body::from(r#"{"a":1}"#))
            .unwrap()
    };

    let (status, body) = send(&app, post("req-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requestId"], "req-1");

    let (status, body) = send(&app, post("req-1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"code": 159, "error": "Duplicate request"}));

    let (status, _) = send(&app, post("req-2")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_request_id_ignored_for_reads_and_uncovered_paths() {
    let app = router(vec![idempotent_app()]);

    for _ in 0..2 {
        let req = client(Method::GET, "/classes/Foo", "203.0.113.9")
            .header("x-parse-request-id", "read-1")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);

        let req = client(Method::POST, "/functions/hello", "203.0.113.9")
            .header("x-parse-request-id", "fn-1")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
    }
}
