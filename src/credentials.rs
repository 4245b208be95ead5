//! Credential extraction.
//!
//! Collects everything a caller presented to identify itself (headers,
//! HTTP basic auth, and credential fields embedded in the body) into one
//! [`CredentialBundle`]. Extraction is a pure transform: it takes the
//! parsed body by value and hands back the residual body with every
//! consumed credential field removed.
//!
//! # Body Credentials
//!
//! Browsers that cannot set custom headers send credentials as underscore
//! fields in the JSON body (`_ApplicationId`, `_JavaScriptKey`, ...). Those
//! are only consulted when the headers and basic auth did not already name
//! a known application. A file upload carrying such a JSON document is
//! parsed first and turned back into binary from its `base64` field.

use std::fmt;
use std::sync::LazyLock;

use axum::body::Bytes;
use axum::http::{HeaderMap, Method, header};
use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::auth::constant_time_eq;
use crate::error::{AdmissionError, AdmissionResult};
use crate::registry::AppRegistry;

/// Request headers read by the extractor.
pub mod headers {
    pub const APPLICATION_ID: &str = "x-parse-application-id";
    pub const SESSION_TOKEN: &str = "x-parse-session-token";
    pub const MASTER_KEY: &str = "x-parse-master-key";
    pub const MAINTENANCE_KEY: &str = "x-parse-maintenance-key";
    pub const INSTALLATION_ID: &str = "x-parse-installation-id";
    pub const CLIENT_KEY: &str = "x-parse-client-key";
    pub const JAVASCRIPT_KEY: &str = "x-parse-javascript-key";
    pub const WINDOWS_KEY: &str = "x-parse-windows-key";
    pub const REST_API_KEY: &str = "x-parse-rest-api-key";
    pub const CLIENT_VERSION: &str = "x-parse-client-version";
    pub const CLOUD_CONTEXT: &str = "x-parse-cloud-context";
}

const BASIC_PREFIX: &str = "basic ";
const JAVASCRIPT_KEY_PREFIX: &str = "javascript-key=";

/// Standard alphabet, padding optional.
const BASIC_AUTH_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// SDK name and version parsed from a client version string like `js1.9.2`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientSdk {
    pub sdk: String,
    pub version: String,
}

#[allow(clippy::expect_used)]
static CLIENT_VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([-a-z]+)([0-9.]+)").expect("client version regex is valid")
});

impl ClientSdk {
    /// Finds the first run of letters or dashes immediately followed by
    /// digits and dots. Case is folded.
    pub fn parse(client_version: &str) -> Option<Self> {
        let lower = client_version.to_ascii_lowercase();
        let captures = CLIENT_VERSION_REGEX.captures(&lower)?;
        Some(Self {
            sdk: captures.get(1)?.as_str().to_string(),
            version: captures.get(2)?.as_str().to_string(),
        })
    }
}

/// Everything the caller presented, immutable after extraction.
#[derive(Clone, Default, PartialEq)]
pub struct CredentialBundle {
    /// Always names a registered application once extraction succeeded.
    pub app_id: String,
    pub session_token: Option<String>,
    pub master_key: Option<String>,
    pub maintenance_key: Option<String>,
    pub installation_id: Option<String>,
    pub client_key: Option<String>,
    pub javascript_key: Option<String>,
    /// `X-Parse-Windows-Key`.
    pub legacy_key: Option<String>,
    pub rest_api_key: Option<String>,
    pub client_version: Option<String>,
    pub client_sdk: Option<ClientSdk>,
    pub context: Map<String, Value>,
}

impl CredentialBundle {
    pub fn for_app(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Self::default()
        }
    }
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("app_id", &self.app_id)
            .field("installation_id", &self.installation_id)
            .field("client_version", &self.client_version)
            .field("has_session_token", &self.session_token.is_some())
            .field("has_master_key", &self.master_key.is_some())
            .field("has_maintenance_key", &self.maintenance_key.is_some())
            .field("context_keys", &self.context.len())
            .finish_non_exhaustive()
    }
}

/// Parsed request body.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Map<String, Value>),
    Binary(Bytes),
}

impl RequestBody {
    /// Serialize back into bytes for the downstream handler.
    pub fn into_bytes(self) -> Bytes {
        match self {
            RequestBody::Empty => Bytes::new(),
            RequestBody::Json(map) => Bytes::from(Value::Object(map).to_string()),
            RequestBody::Binary(bytes) => bytes,
        }
    }
}

/// Output of [`extract`].
#[derive(Debug, Clone)]
pub struct Extraction {
    pub credentials: CredentialBundle,
    pub body: RequestBody,
    /// Effective content type, possibly overridden by `_ContentType`.
    pub content_type: Option<String>,
    /// `fileData` of a file upload that arrived as JSON.
    pub file_data: Option<Value>,
}

/// Mutable state while extraction is in progress.
#[derive(Default)]
struct Draft {
    app_id: Option<String>,
    session_token: Option<String>,
    master_key: Option<String>,
    maintenance_key: Option<String>,
    installation_id: Option<String>,
    client_key: Option<String>,
    javascript_key: Option<String>,
    legacy_key: Option<String>,
    rest_api_key: Option<String>,
    client_version: Option<String>,
}

impl Draft {
    fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| header_value(headers, name);
        Self {
            app_id: get(headers::APPLICATION_ID),
            session_token: get(headers::SESSION_TOKEN),
            master_key: get(headers::MASTER_KEY),
            maintenance_key: get(headers::MAINTENANCE_KEY),
            installation_id: get(headers::INSTALLATION_ID),
            client_key: get(headers::CLIENT_KEY),
            javascript_key: get(headers::JAVASCRIPT_KEY),
            legacy_key: get(headers::WINDOWS_KEY),
            rest_api_key: get(headers::REST_API_KEY),
            client_version: get(headers::CLIENT_VERSION),
        }
    }

    fn finish(self, app_id: String, context: Map<String, Value>) -> CredentialBundle {
        let client_sdk = self.client_version.as_deref().and_then(ClientSdk::parse);
        CredentialBundle {
            app_id,
            session_token: self.session_token,
            master_key: self.master_key,
            maintenance_key: self.maintenance_key,
            installation_id: self.installation_id,
            client_key: self.client_key,
            javascript_key: self.javascript_key,
            legacy_key: self.legacy_key,
            rest_api_key: self.rest_api_key,
            client_version: self.client_version,
            client_sdk,
            context,
        }
    }
}

/// Credentials decoded from an `Authorization: Basic` header.
#[derive(Debug, PartialEq, Eq)]
pub struct BasicAuth {
    pub app_id: String,
    pub master_key: Option<String>,
    pub javascript_key: Option<String>,
}

/// Build the credential bundle for a request.
///
/// Fails with `MalformedContext` for a non-object context and with
/// `InvalidRequest` when no registered application can be identified.
pub fn extract(
    headers: &HeaderMap,
    body: RequestBody,
    registry: &dyn AppRegistry,
) -> AdmissionResult<Extraction> {
    let mut draft = Draft::from_headers(headers);
    let mut context = match header_value(headers, headers::CLOUD_CONTEXT) {
        Some(raw) => parse_context_str(&raw)?,
        None => Map::new(),
    };
    let mut content_type = header_value(headers, header::CONTENT_TYPE.as_str());

    if let Some(basic) = decode_basic_auth(headers)
        && registry.contains(&basic.app_id)
    {
        draft.app_id = Some(basic.app_id);
        if basic.master_key.is_some() {
            draft.master_key = basic.master_key;
        }
        if basic.javascript_key.is_some() {
            draft.javascript_key = basic.javascript_key;
        }
    }

    let mut body = body;
    if let RequestBody::Json(map) = &mut body {
        map.remove("_noBody");
    }

    if let Some(app_id) = draft.app_id.clone()
        && registry.contains(&app_id)
    {
        return Ok(Extraction {
            credentials: draft.finish(app_id, context),
            body,
            content_type,
            file_data: None,
        });
    }

    let (mut fields, from_file) = match body {
        RequestBody::Json(map) => (map, false),
        RequestBody::Binary(bytes) => (parse_file_payload(&bytes)?, true),
        RequestBody::Empty => {
            return Err(AdmissionError::InvalidRequest(
                "no resolvable application id".to_string(),
            ));
        }
    };

    fields.remove("_RevocableSession");

    let app = scalar_string(fields.get("_ApplicationId"))
        .and_then(|id| registry.lookup(&id))
        .ok_or_else(|| {
            AdmissionError::InvalidRequest("no resolvable application id".to_string())
        })?;

    let body_master = scalar_string(fields.get("_MasterKey"));
    if let Some(known) = draft.master_key.as_deref() {
        let agrees = constant_time_eq(known, &app.master_key)
            && body_master.as_deref().is_none_or(|m| constant_time_eq(m, known));
        if !agrees {
            return Err(AdmissionError::InvalidRequest(
                "body credentials conflict with the presented master key".to_string(),
            ));
        }
    }

    fields.remove("_ApplicationId");
    draft.javascript_key = Some(take_string(&mut fields, "_JavaScriptKey").unwrap_or_default());
    if let Some(version) = take_string(&mut fields, "_ClientVersion") {
        draft.client_version = Some(version);
    }
    if let Some(installation_id) = take_string(&mut fields, "_InstallationId") {
        draft.installation_id = Some(installation_id);
    }
    if let Some(token) = take_string(&mut fields, "_SessionToken") {
        draft.session_token = Some(token);
    }
    if let Some(master) = take_string(&mut fields, "_MasterKey") {
        draft.master_key = Some(master);
    }
    if let Some(raw) = fields.remove("_context") {
        context = parse_context_value(raw)?;
    }
    if let Some(overridden) = take_string(&mut fields, "_ContentType") {
        content_type = Some(overridden);
    }

    let (body, file_data) = if from_file {
        let file_data = fields.remove("fileData");
        let encoded = fields
            .get("base64")
            .and_then(Value::as_str)
            .ok_or_else(|| AdmissionError::InvalidJson("file payload has no base64 data".into()))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| AdmissionError::InvalidJson(format!("file payload: {e}")))?;
        (RequestBody::Binary(Bytes::from(decoded)), file_data)
    } else {
        (RequestBody::Json(fields), None)
    };

    Ok(Extraction {
        credentials: draft.finish(app.app_id.clone(), context),
        body,
        content_type,
        file_data,
    })
}

/// Replace the method of a POST whose JSON body carries `_method`.
///
/// The field is always removed from a POST body. Returns the new method
/// when one was given and is a valid HTTP method.
pub fn apply_method_override(method: &Method, body: &mut RequestBody) -> Option<Method> {
    if method != Method::POST {
        return None;
    }
    let RequestBody::Json(map) = body else {
        return None;
    };
    let requested = map.remove("_method")?;
    let name = requested.as_str()?.to_ascii_uppercase();
    Method::from_bytes(name.as_bytes()).ok()
}

/// Parse a context given as a JSON string. Only objects are accepted.
pub fn parse_context_str(raw: &str) -> AdmissionResult<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(AdmissionError::MalformedContext),
    }
}

fn parse_context_value(value: Value) -> AdmissionResult<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        Value::String(raw) => parse_context_str(&raw),
        _ => Err(AdmissionError::MalformedContext),
    }
}

fn parse_file_payload(bytes: &[u8]) -> AdmissionResult<Map<String, Value>> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(AdmissionError::InvalidRequest(
            "file payload is not a JSON object".to_string(),
        )),
        Err(e) => Err(AdmissionError::InvalidRequest(format!(
            "file payload is not JSON: {e}"
        ))),
    }
}

fn decode_basic_auth(headers: &HeaderMap) -> Option<BasicAuth> {
    let value = header_value(headers, header::AUTHORIZATION.as_str())?;
    let prefix = value.get(..BASIC_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(BASIC_PREFIX) {
        return None;
    }
    parse_basic_credentials(value.get(BASIC_PREFIX.len()..)?)
}

/// Decode `base64(appId:secret)`. Anything that does not split into exactly
/// two parts is ignored.
pub fn parse_basic_credentials(encoded: &str) -> Option<BasicAuth> {
    let decoded = BASIC_AUTH_ENGINE.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;

    let mut parts = decoded.split(':');
    let (app_id, secret) = match (parts.next(), parts.next(), parts.next()) {
        (Some(app_id), Some(secret), None) => (app_id, secret),
        _ => return None,
    };

    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
    let (master_key, javascript_key) = match secret.strip_prefix(JAVASCRIPT_KEY_PREFIX) {
        Some(js) => (None, non_empty(js)),
        None => (non_empty(secret), None),
    };

    Some(BasicAuth {
        app_id: app_id.to_string(),
        master_key,
        javascript_key,
    })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Strings as-is, numbers and booleans stringified, everything else absent.
fn scalar_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    let value = fields.remove(key);
    scalar_string(value.as_ref())
}
