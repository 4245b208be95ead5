//! Admission pipeline.
//!
//! Runs the admission steps for one request, strictly in order:
//!
//! ```text
//! method override ─► extract credentials ─► resolve app ─► server state
//!        ─► classify tier ─► [resolve session] ─► rate limits ─► Admitted
//! ```
//!
//! Any step can reject, which ends the pipeline. Session resolution happens
//! at most once, before rate limiting, so user-zone rules key on the
//! identity that was actually resolved.
//!
//! The pipeline knows nothing about HTTP plumbing. The middleware buffers
//! the body, builds an [`InboundRequest`] and turns the outcome into either
//! an error response or request extensions.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Method};
use serde_json::Value;
use tracing::{debug, error};

use crate::auth::{self, AuthContext, Decision, Identity, SessionLookup};
use crate::credentials::{self, CredentialBundle, RequestBody};
use crate::error::{AdmissionError, AdmissionResult};
use crate::rate_limit::{RateLimiter, RuleInput};
use crate::registry::{AppConfig, AppRegistry};
use crate::session::SessionResolver;

/// Everything admission looks at.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    /// Request path without the query string.
    pub path: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
    pub client_ip: String,
    pub verified_identity: Option<Identity>,
}

/// A request that passed admission.
#[derive(Debug, Clone)]
pub struct Admitted {
    /// Effective method after `_method` override.
    pub method: Method,
    pub auth: AuthContext,
    pub app: Arc<AppConfig>,
    pub credentials: CredentialBundle,
    pub body: RequestBody,
    pub content_type: Option<String>,
    pub file_data: Option<Value>,
}

pub struct AdmissionPipeline {
    registry: Arc<dyn AppRegistry>,
    sessions: Arc<dyn SessionResolver>,
    limiter: RateLimiter,
    collaborator_timeout: Duration,
}

impl AdmissionPipeline {
    pub fn new(
        registry: Arc<dyn AppRegistry>,
        sessions: Arc<dyn SessionResolver>,
        collaborator_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            sessions,
            limiter: RateLimiter::new(collaborator_timeout),
            collaborator_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<dyn AppRegistry> {
        &self.registry
    }

    pub async fn admit(&self, request: InboundRequest) -> AdmissionResult<Admitted> {
        let InboundRequest {
            method,
            path,
            headers,
            mut body,
            client_ip,
            verified_identity,
        } = request;

        let method = credentials::apply_method_override(&method, &mut body).unwrap_or(method);

        let extraction = credentials::extract(&headers, body, self.registry.as_ref())?;
        let credentials = extraction.credentials;

        // Extraction only succeeds for registered apps, so a miss here means
        // the app was removed in between.
        let app = self.registry.lookup(&credentials.app_id).ok_or_else(|| {
            AdmissionError::Internal(format!("app {} vanished during admission", credentials.app_id))
        })?;

        if let Some(state) = app.unhealthy_state() {
            return Err(AdmissionError::InvalidServerState(state.to_string()));
        }

        let classification = auth::classify(
            &credentials,
            &app,
            &client_ip,
            &path,
            verified_identity.as_ref(),
        )?;

        let auth = match classification.decision {
            Decision::Granted(auth) => auth,
            Decision::ResolveSession(lookup) => self.resolve_session(lookup).await?,
        };

        debug!(
            app_id = %app.app_id,
            tier = auth.tier_name(),
            client_ip = %client_ip,
            method = %method,
            path = %path,
            "Privilege assigned"
        );

        let input = RuleInput {
            app_id: &app.app_id,
            method: method.as_str(),
            ip: &client_ip,
            session_token: classification.session_token.as_deref(),
            auth: &auth,
        };
        self.limiter.check(&app.rate_limits, &path, &input).await?;

        Ok(Admitted {
            method,
            auth,
            app,
            credentials,
            body: extraction.body,
            content_type: extraction.content_type,
            file_data: extraction.file_data,
        })
    }

    async fn resolve_session(&self, lookup: SessionLookup) -> AdmissionResult<AuthContext> {
        let SessionLookup {
            token,
            installation_id,
            legacy,
        } = lookup;

        let resolution = async {
            if legacy {
                self.sessions.resolve_legacy(&token).await
            } else {
                self.sessions
                    .resolve(&token, installation_id.as_deref())
                    .await
            }
        };

        let identity = match tokio::time::timeout(self.collaborator_timeout, resolution).await {
            Ok(Ok(identity)) => identity,
            Ok(Err(e)) => {
                debug!(legacy, error = %e, "Session resolution failed");
                return Err(e.into());
            }
            Err(_) => {
                error!(timeout = ?self.collaborator_timeout, "Session resolution timed out");
                return Err(AdmissionError::Internal(
                    "session resolution timed out".to_string(),
                ));
            }
        };

        Ok(AuthContext::user(identity, installation_id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::credentials::headers;
    use crate::rate_limit::MemoryCountingStore;
    use crate::registry::{CountingStores, InMemoryAppRegistry};
    use crate::session::{InMemorySessionStore, SessionError};
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Wraps the in-memory store and counts lookups.
    #[derive(Default)]
    struct CountingResolver {
        inner: InMemorySessionStore,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SessionResolver for CountingResolver {
        async fn resolve(
            &self,
            token: &str,
            installation_id: Option<&str>,
        ) -> Result<Identity, SessionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.resolve(token, installation_id).await
        }

        async fn resolve_legacy(&self, token: &str) -> Result<Identity, SessionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.resolve_legacy(token).await
        }
    }

    struct SlowResolver;

    #[async_trait]
    impl SessionResolver for SlowResolver {
        async fn resolve(&self, _: &str, _: Option<&str>) -> Result<Identity, SessionError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Identity::new("late"))
        }

        async fn resolve_legacy(&self, _: &str) -> Result<Identity, SessionError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Identity::new("late"))
        }
    }

    fn registry(definition: Value) -> Arc<InMemoryAppRegistry> {
        let registry = Arc::new(InMemoryAppRegistry::new(CountingStores::new(Arc::new(
            MemoryCountingStore::new(),
        ))));
        registry
            .register_definition(serde_json::from_value(definition).unwrap())
            .unwrap();
        registry
    }

    fn request(pairs: &[(&'static str, &str)], path: &str, ip: &str) -> InboundRequest {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        InboundRequest {
            method: Method::GET,
            path: path.to_string(),
            headers,
            body: RequestBody::Empty,
            client_ip: ip.to_string(),
            verified_identity: None,
        }
    }

    fn pipeline(registry: Arc<InMemoryAppRegistry>, sessions: Arc<dyn SessionResolver>) -> AdmissionPipeline {
        AdmissionPipeline::new(registry, sessions, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_user_zone_resolves_session_once() {
        let resolver = Arc::new(CountingResolver::default());
        resolver.inner.insert("r:abc", "u1", None);
        let registry = registry(json!({
            "appId": "app",
            "masterKey": "master",
            "rateLimit": [{
                "requestPath": "*",
                "requestTimeWindow": 60000,
                "requestCount": 1,
                "zone": "user"
            }]
        }));
        let pipeline = pipeline(registry, resolver.clone());

        let req = request(
            &[(headers::APPLICATION_ID, "app"), (headers::SESSION_TOKEN, "r:abc")],
            "/classes/A",
            "1.1.1.1",
        );
        let admitted = pipeline.admit(req.clone()).await.unwrap();
        assert_eq!(admitted.auth.identity(), Some(&Identity::new("u1")));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

        // same user from a different IP shares the user bucket
        let mut again = req;
        again.client_ip = "2.2.2.2".into();
        let err = pipeline.admit(again).await.unwrap_err();
        assert!(matches!(err, AdmissionError::RateLimited(_)));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_session_rejected_before_rate_limit() {
        let registry = registry(json!({"appId": "app", "masterKey": "master"}));
        let pipeline = pipeline(registry, Arc::new(InMemorySessionStore::new()));
        let req = request(
            &[(headers::APPLICATION_ID, "app"), (headers::SESSION_TOKEN, "r:bad")],
            "/classes/A",
            "1.1.1.1",
        );
        let err = pipeline.admit(req).await.unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidSessionToken(_)));
    }

    #[tokio::test]
    async fn test_legacy_upgrade_uses_legacy_lookup() {
        let sessions = Arc::new(InMemorySessionStore::new());
        sessions.insert_legacy("old-token", "u9");
        let registry = registry(json!({"appId": "app", "masterKey": "master"}));
        let pipeline = pipeline(registry, sessions);
        let req = request(
            &[(headers::APPLICATION_ID, "app"), (headers::SESSION_TOKEN, "old-token")],
            "/upgradeToRevocableSession",
            "1.1.1.1",
        );
        let admitted = pipeline.admit(req).await.unwrap();
        assert_eq!(admitted.auth.identity(), Some(&Identity::new("u9")));
    }

    #[tokio::test]
    async fn test_bad_server_state() {
        let registry = registry(json!({"appId": "app", "masterKey": "master", "state": "initialized"}));
        let pipeline = pipeline(registry, Arc::new(InMemorySessionStore::new()));
        let req = request(&[(headers::APPLICATION_ID, "app")], "/x", "1.1.1.1");
        let err = pipeline.admit(req).await.unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidServerState(ref s) if s == "initialized"));
    }

    #[tokio::test]
    async fn test_method_override_feeds_rate_limit_filter() {
        let registry = registry(json!({
            "appId": "app",
            "masterKey": "master",
            "rateLimit": [{
                "requestPath": "*",
                "requestTimeWindow": 60000,
                "requestCount": 1,
                "requestMethods": ["GET"]
            }]
        }));
        let pipeline = pipeline(registry, Arc::new(InMemorySessionStore::new()));

        let overridden = || {
            let mut req = request(&[(headers::APPLICATION_ID, "app")], "/classes/A", "1.1.1.1");
            req.method = Method::POST;
            req.body = match json!({"_method": "GET"}) {
                Value::Object(map) => RequestBody::Json(map),
                _ => unreachable!(),
            };
            req
        };

        let admitted = pipeline.admit(overridden()).await.unwrap();
        assert_eq!(admitted.method, Method::GET);
        let err = pipeline.admit(overridden()).await.unwrap_err();
        assert!(matches!(err, AdmissionError::RateLimited(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_timeout_is_internal() {
        let registry = registry(json!({"appId": "app", "masterKey": "master"}));
        let pipeline = AdmissionPipeline::new(registry, Arc::new(SlowResolver), Duration::from_millis(100));
        let req = request(
            &[(headers::APPLICATION_ID, "app"), (headers::SESSION_TOKEN, "r:abc")],
            "/x",
            "1.1.1.1",
        );
        let err = pipeline.admit(req).await.unwrap_err();
        assert!(matches!(err, AdmissionError::Internal(_)));
    }

    #[tokio::test]
    async fn test_master_rejection_short_circuits_session() {
        let resolver = Arc::new(CountingResolver::default());
        let registry = registry(json!({
            "appId": "app",
            "masterKey": "master",
            "masterKeyIps": ["10.0.0.1/32"]
        }));
        let pipeline = pipeline(registry, resolver.clone());
        let req = request(
            &[
                (headers::APPLICATION_ID, "app"),
                (headers::MASTER_KEY, "master"),
                (headers::SESSION_TOKEN, "r:abc"),
            ],
            "/x",
            "10.0.0.5",
        );
        let err = pipeline.admit(req).await.unwrap_err();
        assert!(matches!(err, AdmissionError::InvalidRequest(_)));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }
}
