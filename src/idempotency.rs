//! Duplicate-request suppression.
//!
//! A client that retries a mutating call tags every attempt with the same
//! `X-Parse-Request-Id`. The first attempt writes a unique record; any
//! attempt that arrives while that record is alive is rejected with
//! `DuplicateRequest`. The store expires records after the app's TTL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::error::{AdmissionError, AdmissionResult};
use crate::registry::AppConfig;

pub const REQUEST_ID_HEADER: &str = "x-parse-request-id";
pub const IDEMPOTENCY_COLLECTION: &str = "_Idempotency";

fn default_ttl() -> u64 {
    300
}

/// Longest accepted record lifetime: ten years.
pub const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Per-app idempotency settings as configured.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IdempotencyOptions {
    #[serde(default)]
    pub paths: Vec<String>,
    /// Record lifetime in seconds.
    #[serde(default = "default_ttl")]
    pub ttl: u64,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("ttl must be greater than 0")]
    ZeroTtl,

    #[error("ttl of {0}s exceeds the maximum of {MAX_TTL_SECS}s")]
    TtlTooLong(u64),

    #[error("invalid path pattern {0:?}: {1}")]
    Pattern(String, regex::Error),
}

/// Compiled form of [`IdempotencyOptions`].
#[derive(Debug, Clone)]
pub struct IdempotencyPolicy {
    patterns: Vec<Regex>,
    ttl: Duration,
}

impl IdempotencyPolicy {
    pub fn compile(options: &IdempotencyOptions) -> Result<Self, PolicyError> {
        if options.ttl == 0 {
            return Err(PolicyError::ZeroTtl);
        }
        if options.ttl > MAX_TTL_SECS {
            return Err(PolicyError::TtlTooLong(options.ttl));
        }
        let patterns = options
            .paths
            .iter()
            .map(|path| {
                let anchored = if path.starts_with('^') {
                    path.clone()
                } else {
                    format!("^{path}")
                };
                Regex::new(&anchored).map_err(|e| PolicyError::Pattern(path.clone(), e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            patterns,
            ttl: Duration::from_secs(options.ttl),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether a request path falls under the policy. One leading and one
    /// trailing slash are ignored.
    pub fn covers(&self, path: &str) -> bool {
        let path = path.strip_prefix('/').unwrap_or(path);
        let path = path.strip_suffix('/').unwrap_or(path);
        self.patterns.iter().any(|re| re.is_match(path))
    }
}

/// A record as handed to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub req_id: String,
    pub expire: DateTime<Utc>,
}

/// A record as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub object_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: IdempotencyRecord,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordStoreError {
    #[error("A duplicate value for a field with unique values was provided")]
    DuplicateValue,

    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// Storage that can create records under a uniqueness constraint.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// False for stores that cannot enforce uniqueness. The guard is then a no-op.
    fn supports_unique_records(&self) -> bool;

    /// Create `record` in `collection`, failing with
    /// [`RecordStoreError::DuplicateValue`] if a live record with the same
    /// request id exists. `auth` is the privilege the write runs under.
    async fn create_unique(
        &self,
        collection: &str,
        record: IdempotencyRecord,
        auth: &AuthContext,
    ) -> Result<StoredRecord, RecordStoreError>;

    /// Drop expired records. Returns how many were removed.
    fn purge_expired(&self) -> usize {
        0
    }
}

/// Process-local record store keyed by `(collection, reqId)`.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: DashMap<(String, String), StoredRecord>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    fn supports_unique_records(&self) -> bool {
        true
    }

    async fn create_unique(
        &self,
        collection: &str,
        record: IdempotencyRecord,
        auth: &AuthContext,
    ) -> Result<StoredRecord, RecordStoreError> {
        let now = Utc::now();
        let stored = StoredRecord {
            object_id: Uuid::new_v4().simple().to_string(),
            created_at: now,
            record,
        };

        match self
            .records
            .entry((collection.to_string(), stored.record.req_id.clone()))
        {
            Entry::Occupied(existing) if existing.get().record.expire > now => {
                Err(RecordStoreError::DuplicateValue)
            }
            Entry::Occupied(mut expired) => {
                expired.insert(stored.clone());
                debug!(collection, tier = auth.tier_name(), "Replaced expired record");
                Ok(stored)
            }
            Entry::Vacant(slot) => {
                slot.insert(stored.clone());
                debug!(collection, tier = auth.tier_name(), "Created record");
                Ok(stored)
            }
        }
    }

    fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.records.len();
        self.records.retain(|_, stored| stored.record.expire > now);
        before.saturating_sub(self.records.len())
    }
}

/// Runs the duplicate check for one request.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn RecordStore>,
    timeout: Duration,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn RecordStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Reject the request if `request_id` was already seen for a covered path.
    pub async fn ensure(
        &self,
        request_id: Option<&str>,
        path: &str,
        app: &AppConfig,
    ) -> AdmissionResult<()> {
        if !self.store.supports_unique_records() {
            return Ok(());
        }
        let Some(request_id) = request_id.filter(|id| !id.is_empty()) else {
            return Ok(());
        };
        let Some(policy) = app.idempotency.as_ref() else {
            return Ok(());
        };
        if !policy.covers(path) {
            return Ok(());
        }

        let expire = chrono::Duration::from_std(policy.ttl())
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .ok_or_else(|| {
                AdmissionError::Internal(format!(
                    "idempotency ttl {:?} is out of range",
                    policy.ttl()
                ))
            })?;
        let record = IdempotencyRecord {
            req_id: request_id.to_string(),
            expire,
        };

        // The write is a system operation, whatever the caller's tier
        let system = AuthContext::master(false, None);
        let insert = self
            .store
            .create_unique(IDEMPOTENCY_COLLECTION, record, &system);

        match tokio::time::timeout(self.timeout, insert).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(RecordStoreError::DuplicateValue)) => {
                warn!(app_id = %app.app_id, request_id, path, "Duplicate request rejected");
                crate::metrics::record_idempotency_duplicate(&app.app_id);
                Err(AdmissionError::DuplicateRequest)
            }
            Ok(Err(RecordStoreError::Unavailable(e))) => Err(AdmissionError::Internal(e)),
            Err(_) => Err(AdmissionError::Internal(format!(
                "idempotency record insert timed out after {:?}",
                self.timeout
            ))),
        }
    }
}
