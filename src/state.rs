//! Shared application state for Axum handlers.
//!
//! Holds the collaborators admission runs against (registry, session
//! store, record store) plus the assembled pipeline, and owns the
//! background housekeeping task.
//!
//! # Structured Concurrency
//!
//! The reaper is tracked by a `TaskTracker` and stopped through a
//! `CancellationToken`. Call [`AppState::shutdown`] before exit to let it
//! finish cleanly.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use crate::config::Config;
use crate::idempotency::{IdempotencyGuard, InMemoryRecordStore, RecordStore};
use crate::ip_policy::IpPolicy;
use crate::metrics;
use crate::pipeline::AdmissionPipeline;
use crate::rate_limit::MemoryCountingStore;
use crate::registry::{Bootstrap, CountingStores, InMemoryAppRegistry, RegistryError};
use crate::session::InMemorySessionStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<InMemoryAppRegistry>,
    pub sessions: Arc<InMemorySessionStore>,
    pub pipeline: Arc<AdmissionPipeline>,
    pub idempotency: IdempotencyGuard,
    pub trusted_proxies: Arc<IpPolicy>,
    pub started_at: Instant,
    records: Arc<dyn RecordStore>,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build state with in-memory stores seeded from `bootstrap`, and start
    /// the reaper.
    pub fn new(config: Config, bootstrap: Bootstrap) -> Result<Self, RegistryError> {
        let registry = Arc::new(InMemoryAppRegistry::new(CountingStores::new(Arc::new(
            MemoryCountingStore::new(),
        ))));
        for definition in bootstrap.apps {
            registry.register_definition(definition)?;
        }

        let sessions = Arc::new(InMemorySessionStore::new());
        sessions.seed(bootstrap.sessions);

        Ok(Self::with_stores(
            config,
            registry,
            sessions,
            Arc::new(InMemoryRecordStore::new()),
        ))
    }

    /// Build state around caller-supplied stores, and start the reaper.
    pub fn with_stores(
        config: Config,
        registry: Arc<InMemoryAppRegistry>,
        sessions: Arc<InMemorySessionStore>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        let timeout = config.collaborator_timeout;
        let pipeline = Arc::new(AdmissionPipeline::new(
            registry.clone(),
            sessions.clone(),
            timeout,
        ));
        let trusted_proxies = Arc::new(IpPolicy::new(config.trusted_proxies.clone()));

        metrics::set_registered_apps(registry.len());

        let state = Self {
            config: Arc::new(config),
            registry,
            sessions,
            pipeline,
            idempotency: IdempotencyGuard::new(records.clone(), timeout),
            trusted_proxies,
            started_at: Instant::now(),
            records,
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_reaper_task();
        state
    }

    /// Drop expired idempotency records, expired sessions and idle
    /// rate-limit keys.
    pub fn reap(&self) {
        reap(&self.registry, &self.sessions, self.records.as_ref());
    }

    fn spawn_reaper_task(&self) {
        let registry = self.registry.clone();
        let sessions = self.sessions.clone();
        let records = self.records.clone();
        let period = self.config.reaper_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // first tick fires immediately

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Reaper task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        reap(&registry, &sessions, records.as_ref());
                    }
                }
            }

            debug!("Reaper task shutting down");
        });
    }

    /// Stop background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");
        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        info!("All background tasks have completed");
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

fn reap(registry: &InMemoryAppRegistry, sessions: &InMemorySessionStore, records: &dyn RecordStore) {
    let expired_records = records.purge_expired();
    let expired_sessions = sessions.purge_expired();
    registry.stores().local().purge_stale();

    if expired_records > 0 {
        metrics::record_reaped("idempotency", expired_records);
    }
    if expired_sessions > 0 {
        metrics::record_reaped("session", expired_sessions);
    }
    metrics::set_registered_apps(registry.len());
    trace!(expired_records, expired_sessions, "Reaper pass complete");
}
