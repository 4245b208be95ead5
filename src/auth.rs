//! Privilege classification.
//!
//! Turns a credential bundle into exactly one [`Tier`]. Tiers are tried in a
//! fixed order and the first one that holds wins:
//!
//! ```text
//! maintenance key + maintenance IP ──► Maintenance
//! master key ──┬─ master IP ok ─────► Master
//!              └─ IP rejected ──────► 403 (no downgrade)
//! read-only master key ─────────────► Master { read_only }
//! client keys configured, none match ► 403
//! verified upstream identity ───────► User
//! no session token ─────────────────► Anonymous
//! session token ────────────────────► session lookup
//! ```
//!
//! All key comparisons are constant-time.

use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::{error, warn};

use crate::credentials::CredentialBundle;
use crate::error::{AdmissionError, AdmissionResult};
use crate::registry::AppConfig;

pub const LOGIN_PATH: &str = "/login";
pub const SESSIONS_ME_PATH: &str = "/sessions/me";
pub const UPGRADE_SESSION_PATH: &str = "/upgradeToRevocableSession";

/// Revocable session tokens carry this prefix. Anything else is a legacy token.
const REVOCABLE_PREFIX: &str = "r:";

/// An authenticated end user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// Identity established by an upstream layer (for example a JWT verifier),
/// attached as a request extension.
#[derive(Debug, Clone)]
pub struct VerifiedIdentity(pub Identity);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "tier", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Tier {
    Maintenance,
    Master { read_only: bool },
    User { user: Identity },
    Anonymous,
}

/// Result of admission, attached to every admitted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    #[serde(flatten)]
    tier: Tier,
    installation_id: Option<String>,
}

impl AuthContext {
    pub fn maintenance(installation_id: Option<String>) -> Self {
        Self {
            tier: Tier::Maintenance,
            installation_id,
        }
    }

    pub fn master(read_only: bool, installation_id: Option<String>) -> Self {
        Self {
            tier: Tier::Master { read_only },
            installation_id,
        }
    }

    pub fn user(user: Identity, installation_id: Option<String>) -> Self {
        Self {
            tier: Tier::User { user },
            installation_id,
        }
    }

    pub fn anonymous(installation_id: Option<String>) -> Self {
        Self {
            tier: Tier::Anonymous,
            installation_id,
        }
    }

    pub fn tier(&self) -> &Tier {
        &self.tier
    }

    pub fn installation_id(&self) -> Option<&str> {
        self.installation_id.as_deref()
    }

    /// True for both full and read-only master.
    pub fn is_master(&self) -> bool {
        matches!(self.tier, Tier::Master { .. })
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.tier, Tier::Master { read_only: true })
    }

    pub fn is_maintenance(&self) -> bool {
        matches!(self.tier, Tier::Maintenance)
    }

    pub fn identity(&self) -> Option<&Identity> {
        match &self.tier {
            Tier::User { user } => Some(user),
            _ => None,
        }
    }

    /// Label for logs and metrics.
    pub fn tier_name(&self) -> &'static str {
        match self.tier {
            Tier::Maintenance => "maintenance",
            Tier::Master { read_only: false } => "master",
            Tier::Master { read_only: true } => "read_only_master",
            Tier::User { .. } => "user",
            Tier::Anonymous => "anonymous",
        }
    }
}

/// A session token that still has to be resolved into an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLookup {
    pub token: String,
    pub installation_id: Option<String>,
    pub legacy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Granted(AuthContext),
    ResolveSession(SessionLookup),
}

/// Classifier output. `session_token` is the token that remains in effect
/// after login-path stripping and is what session-zone rate limits key on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub decision: Decision,
    pub session_token: Option<String>,
}

impl Classification {
    fn granted(auth: AuthContext, session_token: Option<String>) -> Self {
        Self {
            decision: Decision::Granted(auth),
            session_token,
        }
    }
}

/// Assign a privilege tier, or decide that a session lookup is needed.
pub fn classify(
    credentials: &CredentialBundle,
    app: &AppConfig,
    ip: &str,
    path: &str,
    verified: Option<&Identity>,
) -> AdmissionResult<Classification> {
    let installation_id = credentials.installation_id.clone();
    let session_token = credentials.session_token.clone();

    if keys_match(credentials.maintenance_key.as_deref(), app.maintenance_key.as_deref()) {
        if app.maintenance_key_ips.is_allowed(ip) {
            return Ok(Classification::granted(
                AuthContext::maintenance(installation_id),
                session_token,
            ));
        }
        error!(
            app_id = %app.app_id,
            client_ip = %ip,
            "Maintenance key rejected: client IP is not in maintenanceKeyIps"
        );
    }

    let presented_master = credentials.master_key.as_deref();
    if keys_match(presented_master, Some(&app.master_key)) {
        if app.master_key_ips.is_allowed(ip) {
            return Ok(Classification::granted(
                AuthContext::master(false, installation_id),
                session_token,
            ));
        }
        warn!(
            app_id = %app.app_id,
            client_ip = %ip,
            "Master key rejected: client IP is not in masterKeyIps"
        );
        return Err(AdmissionError::InvalidRequest(
            "master key used from a disallowed IP".to_string(),
        ));
    }

    if keys_match(presented_master, app.read_only_master_key.as_deref()) {
        return Ok(Classification::granted(
            AuthContext::master(true, installation_id),
            session_token,
        ));
    }

    check_client_keys(credentials, app)?;

    let session_token = if path == LOGIN_PATH {
        None
    } else {
        session_token
    };

    if let Some(identity) = verified {
        return Ok(Classification::granted(
            AuthContext::user(identity.clone(), installation_id),
            session_token,
        ));
    }

    let Some(token) = session_token.clone() else {
        return Ok(Classification::granted(
            AuthContext::anonymous(installation_id),
            None,
        ));
    };

    if path == SESSIONS_ME_PATH {
        return Ok(Classification::granted(
            AuthContext::anonymous(installation_id),
            session_token,
        ));
    }

    let legacy = path == UPGRADE_SESSION_PATH && !token.starts_with(REVOCABLE_PREFIX);
    Ok(Classification {
        decision: Decision::ResolveSession(SessionLookup {
            token,
            installation_id,
            legacy,
        }),
        session_token,
    })
}

/// Reject anything below full or read-only master.
pub fn require_master(auth: &AuthContext) -> AdmissionResult<()> {
    if auth.is_master() {
        Ok(())
    } else {
        Err(AdmissionError::Unauthorized(
            "unauthorized: master key is required".to_string(),
        ))
    }
}

/// When any client key is configured, at least one configured key must match.
fn check_client_keys(credentials: &CredentialBundle, app: &AppConfig) -> AdmissionResult<()> {
    let pairs = [
        (credentials.client_key.as_deref(), app.client_key.as_deref()),
        (credentials.javascript_key.as_deref(), app.javascript_key.as_deref()),
        (credentials.legacy_key.as_deref(), app.legacy_key.as_deref()),
        (credentials.rest_api_key.as_deref(), app.rest_api_key.as_deref()),
    ];

    let any_configured = pairs.iter().any(|(_, expected)| expected.is_some());
    if !any_configured {
        return Ok(());
    }

    if pairs.iter().any(|(given, expected)| keys_match(*given, *expected)) {
        Ok(())
    } else {
        Err(AdmissionError::InvalidRequest(
            "no configured client key matched".to_string(),
        ))
    }
}

/// Both sides present and equal, compared in constant time.
fn keys_match(given: Option<&str>, expected: Option<&str>) -> bool {
    match (given, expected) {
        (Some(given), Some(expected)) => constant_time_eq(given, expected),
        _ => false,
    }
}

pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
