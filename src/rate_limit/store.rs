//! Counting stores behind rate-limit rules.
//!
//! A rule never counts on its own: it hands a derived key to a
//! [`CountingStore`] and asks whether one more hit fits in the window. The
//! limiter does not care whether the store is process-local or shared
//! between processes, which is what lets a multi-process deployment plug in
//! a networked store without touching rule evaluation.
//!
//! # Local Store
//!
//! [`MemoryCountingStore`] keeps a fixed window per key. The first hit opens
//! the window, at most `max` hits are admitted until it closes, and the next
//! hit after that opens a fresh one.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;

/// Failure of the counting store itself, as opposed to a limit violation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("counting store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid quota: {0}")]
    InvalidQuota(String),
}

/// Atomic hit counter shared by the rules bound to it.
#[async_trait]
pub trait CountingStore: Send + Sync {
    /// Record one hit for `key` and report whether it stays within `max`
    /// hits per `window`.
    async fn increment(&self, key: &str, window: Duration, max: u32) -> Result<bool, StoreError>;

    /// Drop state for keys that can no longer affect a decision.
    fn purge_stale(&self) {}
}

#[derive(Debug, Clone, Copy)]
struct FixedWindow {
    opened_at: Instant,
    length: Duration,
    hits: u32,
}

impl FixedWindow {
    fn open(now: Instant, length: Duration) -> Self {
        Self {
            opened_at: now,
            length,
            hits: 0,
        }
    }

    fn is_closed(&self, now: Instant) -> bool {
        now.duration_since(self.opened_at) >= self.length
    }
}

/// In-process fixed-window counting store.
#[derive(Debug, Default)]
pub struct MemoryCountingStore {
    windows: DashMap<String, FixedWindow>,
}

impl MemoryCountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a tracked window.
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }
}

#[async_trait]
impl CountingStore for MemoryCountingStore {
    async fn increment(&self, key: &str, window: Duration, max: u32) -> Result<bool, StoreError> {
        if max == 0 {
            return Err(StoreError::InvalidQuota(
                "max must be greater than 0".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(StoreError::InvalidQuota(format!(
                "window {window:?} is too short"
            )));
        }

        let now = Instant::now();
        // The shard lock is held until `slot` drops, so check-and-count is atomic per key
        let mut slot = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| FixedWindow::open(now, window));
        if slot.is_closed(now) || slot.length != window {
            *slot = FixedWindow::open(now, window);
        }

        if slot.hits >= max {
            return Ok(false);
        }
        slot.hits += 1;
        Ok(true)
    }

    fn purge_stale(&self) {
        let now = Instant::now();
        self.windows.retain(|_, slot| !slot.is_closed(now));
        trace!(keys = self.windows.len(), "Purged stale rate limit keys");
    }
}
