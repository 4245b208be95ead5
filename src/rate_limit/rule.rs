//! Rate-limit rule options and their compiled form.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use super::store::CountingStore;
use crate::auth::AuthContext;
use crate::ip_policy::is_loopback;

pub const DEFAULT_MESSAGE: &str = "Too many requests.";

/// Which caller attribute a rule counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    Global,
    Session,
    User,
    #[default]
    Ip,
}

/// Where a rule keeps its counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Local,
    Shared,
}

/// `requestMethods` accepts either a list of methods or a single regex.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum MethodSpec {
    List(Vec<String>),
    Pattern(String),
}

/// Options accepted when registering a rule for an application.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RateLimitOptions {
    pub request_path: String,
    /// Window length in milliseconds.
    pub request_time_window: u64,
    pub request_count: u32,
    #[serde(default)]
    pub error_response_message: Option<String>,
    #[serde(default)]
    pub request_methods: Option<MethodSpec>,
    #[serde(default)]
    pub include_master_key: bool,
    #[serde(default)]
    pub include_internal_requests: bool,
    #[serde(default)]
    pub zone: Zone,
    #[serde(default)]
    pub store: StoreKind,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("requestTimeWindow must be greater than 0")]
    ZeroWindow,

    #[error("requestCount must be greater than 0")]
    ZeroCount,

    #[error("invalid requestPath {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("invalid requestMethods pattern {pattern:?}: {reason}")]
    InvalidMethods { pattern: String, reason: String },
}

/// Method filter of a compiled rule.
#[derive(Debug, Clone)]
pub enum MethodFilter {
    Any,
    List(Vec<String>),
    Pattern(Regex),
}

impl MethodFilter {
    pub fn allows(&self, method: &str) -> bool {
        match self {
            MethodFilter::Any => true,
            MethodFilter::List(methods) => methods.iter().any(|m| m.eq_ignore_ascii_case(method)),
            MethodFilter::Pattern(re) => re.is_match(method),
        }
    }
}

/// A rule ready for evaluation. Immutable once built.
pub struct RateLimitRule {
    id: String,
    request_path: String,
    path: Regex,
    window: Duration,
    max: u32,
    zone: Zone,
    methods: MethodFilter,
    include_master_key: bool,
    include_internal_requests: bool,
    message: String,
    store: Arc<dyn CountingStore>,
}

/// What a rule looks at when deciding to skip and deriving its key.
#[derive(Debug, Clone, Copy)]
pub struct RuleInput<'a> {
    pub app_id: &'a str,
    pub method: &'a str,
    pub ip: &'a str,
    pub session_token: Option<&'a str>,
    pub auth: &'a AuthContext,
}

impl RateLimitRule {
    /// Compile `options` into a rule bound to `store`. `id` namespaces the
    /// rule's keys inside the store.
    pub fn compile(
        id: String,
        options: &RateLimitOptions,
        store: Arc<dyn CountingStore>,
    ) -> Result<Self, RuleError> {
        if options.request_time_window == 0 {
            return Err(RuleError::ZeroWindow);
        }
        if options.request_count == 0 {
            return Err(RuleError::ZeroCount);
        }

        let path = compile_path(&options.request_path).map_err(|e| RuleError::InvalidPath {
            path: options.request_path.clone(),
            reason: e.to_string(),
        })?;

        let methods = match &options.request_methods {
            None => MethodFilter::Any,
            Some(MethodSpec::List(list)) => MethodFilter::List(list.clone()),
            Some(MethodSpec::Pattern(pattern)) => {
                MethodFilter::Pattern(Regex::new(pattern).map_err(|e| {
                    RuleError::InvalidMethods {
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    }
                })?)
            }
        };

        Ok(Self {
            id,
            request_path: options.request_path.clone(),
            path,
            window: Duration::from_millis(options.request_time_window),
            max: options.request_count,
            zone: options.zone,
            methods,
            include_master_key: options.include_master_key,
            include_internal_requests: options.include_internal_requests,
            message: options
                .error_response_message
                .clone()
                .unwrap_or_else(|| DEFAULT_MESSAGE.to_string()),
            store,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn matches_path(&self, path: &str) -> bool {
        self.path.is_match(path)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn zone(&self) -> Zone {
        self.zone
    }

    pub fn store(&self) -> &Arc<dyn CountingStore> {
        &self.store
    }

    /// Whether this rule ignores the request entirely.
    pub fn should_skip(&self, input: &RuleInput<'_>) -> bool {
        if is_loopback(input.ip) && !self.include_internal_requests {
            return true;
        }
        if self.include_master_key {
            return false;
        }
        if !self.methods.allows(input.method) {
            return true;
        }
        input.auth.is_master()
    }

    /// Counter key for the request, namespaced by rule id.
    pub fn key_for(&self, input: &RuleInput<'_>) -> String {
        let key = match self.zone {
            Zone::Global => input.app_id,
            Zone::Session => input.session_token.unwrap_or(input.ip),
            Zone::User => input.auth.identity().map(|u| u.user_id.as_str()).unwrap_or(input.ip),
            Zone::Ip => input.ip,
        };
        format!("{}:{}", self.id, key)
    }
}

impl fmt::Debug for RateLimitRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitRule")
            .field("id", &self.id)
            .field("request_path", &self.request_path)
            .field("window", &self.window)
            .field("max", &self.max)
            .field("zone", &self.zone)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

/// Translate a route-style path into an anchored, case-insensitive regex.
///
/// `/*` and a bare `*` match anything, `:name` matches one segment, and
/// parenthesised groups pass through as raw regex. Everything else is
/// literal. A single trailing slash on the request path is tolerated.
fn compile_path(request_path: &str) -> Result<Regex, regex::Error> {
    let mut source = request_path.replace("/*", "/(.*)");
    if source == "*" {
        source = "(.*)".to_string();
    }

    let mut pattern = String::from("(?i)^");
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            ':' if chars.peek().is_some_and(|n| n.is_ascii_alphanumeric() || *n == '_') => {
                while chars.next_if(|n| n.is_ascii_alphanumeric() || *n == '_').is_some() {}
                pattern.push_str("[^/]+?");
            }
            '(' => {
                pattern.push('(');
                let mut depth = 1usize;
                for inner in chars.by_ref() {
                    pattern.push(inner);
                    match inner {
                        '(' => depth += 1,
                        ')' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
            }
            other => pattern.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    if !pattern.ends_with('/') {
        pattern.push_str("/?");
    }
    pattern.push('$');

    Regex::new(&pattern)
}
