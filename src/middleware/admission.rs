//! Tower layer that runs the admission pipeline in front of every handler.
//!
//! For each request the service:
//!
//! 1. resolves the client IP,
//! 2. buffers and classifies the body (empty, JSON object, or binary),
//! 3. runs [`AdmissionPipeline::admit`],
//! 4. on success rebuilds the request with the residual body and the
//!    effective method, and attaches the admission result as extensions.
//!
//! A rejection is rendered straight from [`AdmissionError`]; the inner
//! service never sees the request.
//!
//! # Extensions Set on Admitted Requests
//!
//! | Type | Content |
//! |------|---------|
//! | [`AuthContext`](crate::auth::AuthContext) | granted tier |
//! | `Arc<AppConfig>` | application configuration |
//! | [`CredentialBundle`](crate::credentials::CredentialBundle) | extracted credentials |
//! | [`ClientIp`] | resolved caller address |
//! | [`FileData`] | `fileData` of a JSON-wrapped upload, when present |

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::{HeaderValue, Request, Response, header};
use axum::response::IntoResponse;
use serde_json::Value;
use tower::{Layer, Service};
use tracing::debug;

use super::ip::{ClientIp, resolve_client_ip};
use crate::auth::VerifiedIdentity;
use crate::credentials::RequestBody;
use crate::error::AdmissionError;
use crate::ip_policy::IpPolicy;
use crate::metrics;
use crate::pipeline::{AdmissionPipeline, InboundRequest};

/// `fileData` carried by an upload that arrived wrapped in JSON.
#[derive(Debug, Clone)]
pub struct FileData(pub Value);

#[derive(Clone)]
pub struct AdmissionLayer {
    pipeline: Arc<AdmissionPipeline>,
    trusted_proxies: Arc<IpPolicy>,
    body_limit: usize,
}

impl AdmissionLayer {
    pub fn new(
        pipeline: Arc<AdmissionPipeline>,
        trusted_proxies: Arc<IpPolicy>,
        body_limit: usize,
    ) -> Self {
        Self {
            pipeline,
            trusted_proxies,
            body_limit,
        }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            pipeline: self.pipeline.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
            body_limit: self.body_limit,
        }
    }
}

#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    pipeline: Arc<AdmissionPipeline>,
    trusted_proxies: Arc<IpPolicy>,
    body_limit: usize,
}

impl<S> Service<Request<Body>> for AdmissionService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let pipeline = self.pipeline.clone();
        let trusted_proxies = self.trusted_proxies.clone();
        let body_limit = self.body_limit;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let started = Instant::now();
            let client_ip = resolve_client_ip(&req, &trusted_proxies).into_owned();
            let (mut parts, body) = req.into_parts();

            let bytes = match axum::body::to_bytes(body, body_limit).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(error = %e, "Failed to buffer request body");
                    return Ok(reject(AdmissionError::PayloadTooLarge, started));
                }
            };

            let content_type = parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok());
            let body = match classify_body(content_type, bytes) {
                Ok(body) => body,
                Err(e) => return Ok(reject(e, started)),
            };

            let inbound = InboundRequest {
                method: parts.method.clone(),
                path: parts.uri.path().to_string(),
                headers: parts.headers.clone(),
                body,
                client_ip: client_ip.clone(),
                verified_identity: parts
                    .extensions
                    .get::<VerifiedIdentity>()
                    .map(|v| v.0.clone()),
            };

            let admitted = match pipeline.admit(inbound).await {
                Ok(admitted) => admitted,
                Err(e) => return Ok(reject(e, started)),
            };

            metrics::record_admission(admitted.auth.tier_name(), started.elapsed());

            parts.method = admitted.method;
            if let Some(content_type) = admitted.content_type
                && let Ok(value) = HeaderValue::from_str(&content_type)
            {
                parts.headers.insert(header::CONTENT_TYPE, value);
            }
            parts.headers.remove(header::CONTENT_LENGTH);
            parts.extensions.insert(admitted.auth);
            parts.extensions.insert(admitted.app);
            parts.extensions.insert(admitted.credentials);
            parts.extensions.insert(ClientIp(client_ip));
            if let Some(file_data) = admitted.file_data {
                parts.extensions.insert(FileData(file_data));
            }

            let req = Request::from_parts(parts, Body::from(admitted.body.into_bytes()));
            inner.call(req).await
        })
    }
}

fn reject(error: AdmissionError, started: Instant) -> Response<Body> {
    metrics::record_rejection(error.reason(), started.elapsed());
    error.into_response()
}

fn is_json_media_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}

/// Sort a buffered body into the shape the pipeline works on.
///
/// Declared JSON must parse to an object. `text/plain` bodies holding a JSON
/// object are treated as JSON too, since browser SDKs send them that way to
/// avoid CORS preflights. Everything else is binary.
pub fn classify_body(content_type: Option<&str>, bytes: Bytes) -> Result<RequestBody, AdmissionError> {
    if bytes.is_empty() {
        return Ok(RequestBody::Empty);
    }

    let content_type = content_type.unwrap_or_default();
    if is_json_media_type(content_type) {
        return match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => Ok(RequestBody::Json(map)),
            Ok(_) => Ok(RequestBody::Binary(bytes)),
            Err(e) => Err(AdmissionError::InvalidJson(e.to_string())),
        };
    }

    if content_type.to_ascii_lowercase().starts_with("text/plain")
        && let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(&bytes)
    {
        return Ok(RequestBody::Json(map));
    }

    Ok(RequestBody::Binary(bytes))
}
