//! Session token resolution.
//!
//! The pipeline only sees [`SessionResolver`]; where sessions live is up to
//! the implementation. [`InMemorySessionStore`] backs the standalone server
//! and the tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::auth::Identity;
use crate::error::AdmissionError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("{0}")]
    InvalidSessionToken(String),

    #[error("{0}")]
    ObjectNotFound(String),

    #[error("session backend failure: {0}")]
    Backend(String),
}

impl From<SessionError> for AdmissionError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::InvalidSessionToken(msg) => AdmissionError::InvalidSessionToken(msg),
            SessionError::ObjectNotFound(msg) => AdmissionError::ObjectNotFound(msg),
            SessionError::Backend(msg) => AdmissionError::Internal(msg),
        }
    }
}

/// Turns a session token into the user it belongs to.
#[async_trait]
pub trait SessionResolver: Send + Sync {
    /// Resolve a revocable session token.
    async fn resolve(
        &self,
        token: &str,
        installation_id: Option<&str>,
    ) -> Result<Identity, SessionError>;

    /// Resolve a pre-revocable token stored directly on the user.
    async fn resolve_legacy(&self, token: &str) -> Result<Identity, SessionError>;
}

/// One session from the bootstrap file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSeed {
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub legacy: bool,
}

#[derive(Debug, Clone)]
struct SessionRecord {
    user_id: String,
    expires_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, SessionRecord>,
    legacy: DashMap<String, String>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, user_id: impl Into<String>, expires_at: Option<DateTime<Utc>>) {
        self.sessions.insert(
            token.into(),
            SessionRecord {
                user_id: user_id.into(),
                expires_at,
            },
        );
    }

    pub fn insert_legacy(&self, token: impl Into<String>, user_id: impl Into<String>) {
        self.legacy.insert(token.into(), user_id.into());
    }

    pub fn seed(&self, seeds: impl IntoIterator<Item = SessionSeed>) {
        for seed in seeds {
            if seed.legacy {
                self.insert_legacy(seed.token, seed.user_id);
            } else {
                self.insert(seed.token, seed.user_id, seed.expires_at);
            }
        }
    }

    /// Remove expired revocable sessions. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, record| !record.is_expired(now));
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len() + self.legacy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionResolver for InMemorySessionStore {
    async fn resolve(
        &self,
        token: &str,
        installation_id: Option<&str>,
    ) -> Result<Identity, SessionError> {
        let record = self
            .sessions
            .get(token)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SessionError::InvalidSessionToken("Invalid session token".into()))?;

        if record.is_expired(Utc::now()) {
            return Err(SessionError::InvalidSessionToken(
                "Session token is expired.".into(),
            ));
        }

        debug!(user_id = %record.user_id, installation_id, "Resolved session");
        Ok(Identity::new(record.user_id))
    }

    async fn resolve_legacy(&self, token: &str) -> Result<Identity, SessionError> {
        self.legacy
            .get(token)
            .map(|entry| Identity::new(entry.value().clone()))
            .ok_or_else(|| SessionError::ObjectNotFound("invalid legacy session token".into()))
    }
}
