//! Application registry.
//!
//! Every request names an application, and everything admission decides is
//! relative to that application's [`AppConfig`]: its keys, its IP allow
//! lists, its rate-limit rules and its idempotency policy.
//!
//! # Rebuild, Never Patch
//!
//! An `AppConfig` is immutable once registered. Changing anything, including
//! adding a rate-limit rule, builds a new config from the stored
//! [`AppDefinition`] and swaps it in. In-flight requests keep the `Arc` they
//! already hold. IP policies start over with empty caches, while rule
//! counters survive because rule ids are stable.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::idempotency::{IdempotencyOptions, IdempotencyPolicy};
use crate::ip_policy::IpPolicy;
use crate::rate_limit::{CountingStore, RateLimitOptions, RateLimitRule, RuleError, StoreKind};
use crate::session::SessionSeed;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid app definition: {0}")]
    InvalidDefinition(String),

    #[error("invalid rate limit option #{index}: {source}")]
    InvalidRateLimit {
        index: usize,
        #[source]
        source: RuleError,
    },

    #[error("invalid idempotency options: {0}")]
    InvalidIdempotency(String),

    #[error("unknown application: {0}")]
    UnknownApp(String),

    #[error("rate limit rule requests the shared store, but none is configured")]
    SharedStoreMissing,

    #[error("failed to load bootstrap file: {0}")]
    Bootstrap(String),
}

fn default_key_ips() -> Vec<String> {
    vec!["127.0.0.1".to_string(), "::1".to_string()]
}

/// Serializable description of an application, as found in the bootstrap file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppDefinition {
    pub app_id: String,
    pub master_key: String,
    pub read_only_master_key: Option<String>,
    pub maintenance_key: Option<String>,
    pub client_key: Option<String>,
    pub javascript_key: Option<String>,
    #[serde(alias = "windowsKey")]
    pub dot_net_key: Option<String>,
    #[serde(rename = "restAPIKey")]
    pub rest_api_key: Option<String>,
    #[serde(default = "default_key_ips")]
    pub master_key_ips: Vec<String>,
    #[serde(default = "default_key_ips")]
    pub maintenance_key_ips: Vec<String>,
    #[serde(default)]
    pub rate_limit: Vec<RateLimitOptions>,
    pub idempotency_options: Option<IdempotencyOptions>,
    /// Anything other than `ok` puts the app out of service.
    pub state: Option<String>,
}

/// The counting stores rules can bind to.
#[derive(Clone)]
pub struct CountingStores {
    local: Arc<dyn CountingStore>,
    shared: Option<Arc<dyn CountingStore>>,
}

impl CountingStores {
    pub fn new(local: Arc<dyn CountingStore>) -> Self {
        Self {
            local,
            shared: None,
        }
    }

    pub fn with_shared(mut self, shared: Arc<dyn CountingStore>) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn local(&self) -> &Arc<dyn CountingStore> {
        &self.local
    }

    fn pick(&self, kind: StoreKind) -> Result<Arc<dyn CountingStore>, RegistryError> {
        match kind {
            StoreKind::Local => Ok(self.local.clone()),
            StoreKind::Shared => self.shared.clone().ok_or(RegistryError::SharedStoreMissing),
        }
    }
}

/// Compiled, immutable configuration of one application.
pub struct AppConfig {
    pub app_id: String,
    pub master_key: String,
    pub read_only_master_key: Option<String>,
    pub maintenance_key: Option<String>,
    pub client_key: Option<String>,
    pub javascript_key: Option<String>,
    pub legacy_key: Option<String>,
    pub rest_api_key: Option<String>,
    pub master_key_ips: IpPolicy,
    pub maintenance_key_ips: IpPolicy,
    pub rate_limits: Vec<Arc<RateLimitRule>>,
    pub idempotency: Option<IdempotencyPolicy>,
    pub state: Option<String>,
    definition: AppDefinition,
}

impl AppConfig {
    pub fn build(definition: AppDefinition, stores: &CountingStores) -> Result<Self, RegistryError> {
        if definition.app_id.is_empty() {
            return Err(RegistryError::InvalidDefinition("appId must not be empty".into()));
        }
        if definition.master_key.is_empty() {
            return Err(RegistryError::InvalidDefinition("masterKey must not be empty".into()));
        }
        if definition.read_only_master_key.as_deref() == Some(definition.master_key.as_str()) {
            return Err(RegistryError::InvalidDefinition(
                "masterKey and readOnlyMasterKey must be different".into(),
            ));
        }

        let rate_limits = definition
            .rate_limit
            .iter()
            .enumerate()
            .map(|(index, options)| {
                let store = stores.pick(options.store)?;
                RateLimitRule::compile(format!("{}#{index}", definition.app_id), options, store)
                    .map(Arc::new)
                    .map_err(|source| RegistryError::InvalidRateLimit { index, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let idempotency = definition
            .idempotency_options
            .as_ref()
            .map(IdempotencyPolicy::compile)
            .transpose()
            .map_err(|e| RegistryError::InvalidIdempotency(e.to_string()))?;

        Ok(Self {
            app_id: definition.app_id.clone(),
            master_key: definition.master_key.clone(),
            read_only_master_key: definition.read_only_master_key.clone(),
            maintenance_key: definition.maintenance_key.clone(),
            client_key: definition.client_key.clone(),
            javascript_key: definition.javascript_key.clone(),
            legacy_key: definition.dot_net_key.clone(),
            rest_api_key: definition.rest_api_key.clone(),
            master_key_ips: IpPolicy::new(definition.master_key_ips.clone()),
            maintenance_key_ips: IpPolicy::new(definition.maintenance_key_ips.clone()),
            rate_limits,
            idempotency,
            state: definition.state.clone(),
            definition,
        })
    }

    pub fn definition(&self) -> &AppDefinition {
        &self.definition
    }

    /// `Some(state)` when the app is out of service.
    pub fn unhealthy_state(&self) -> Option<&str> {
        self.state.as_deref().filter(|s| *s != "ok")
    }

    #[cfg(test)]
    #[allow(clippy::expect_used)]
    pub(crate) fn without_rules(definition: AppDefinition) -> Self {
        let stores = CountingStores::new(Arc::new(crate::rate_limit::MemoryCountingStore::new()));
        Self::build(definition, &stores).expect("test app definition must be valid")
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("app_id", &self.app_id)
            .field("master_key_ips", &self.master_key_ips)
            .field("maintenance_key_ips", &self.maintenance_key_ips)
            .field("rate_limits", &self.rate_limits.len())
            .field("idempotency", &self.idempotency.is_some())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Lookup of application configuration by id.
pub trait AppRegistry: Send + Sync {
    fn lookup(&self, app_id: &str) -> Option<Arc<AppConfig>>;

    /// Insert or replace the configuration for `config.app_id`.
    fn register(&self, config: AppConfig) -> Arc<AppConfig>;

    fn contains(&self, app_id: &str) -> bool {
        self.lookup(app_id).is_some()
    }
}

/// Process-local registry.
pub struct InMemoryAppRegistry {
    apps: DashMap<String, Arc<AppConfig>>,
    stores: CountingStores,
}

impl InMemoryAppRegistry {
    pub fn new(stores: CountingStores) -> Self {
        Self {
            apps: DashMap::new(),
            stores,
        }
    }

    pub fn stores(&self) -> &CountingStores {
        &self.stores
    }

    /// Build and register an application from its definition.
    pub fn register_definition(
        &self,
        definition: AppDefinition,
    ) -> Result<Arc<AppConfig>, RegistryError> {
        let config = AppConfig::build(definition, &self.stores)?;
        info!(
            app_id = %config.app_id,
            rate_limits = config.rate_limits.len(),
            idempotency = config.idempotency.is_some(),
            "Registered application"
        );
        Ok(self.register(config))
    }

    /// Append a rate-limit rule to an application and rebuild its config.
    pub fn add_rate_limit(
        &self,
        app_id: &str,
        options: RateLimitOptions,
    ) -> Result<Arc<AppConfig>, RegistryError> {
        // Holding the entry serialises concurrent rebuilds of the same app
        let mut entry = self
            .apps
            .get_mut(app_id)
            .ok_or_else(|| RegistryError::UnknownApp(app_id.to_string()))?;

        let mut definition = entry.definition().clone();
        definition.rate_limit.push(options);
        let rebuilt = Arc::new(AppConfig::build(definition, &self.stores)?);
        *entry = rebuilt.clone();

        info!(app_id, rate_limits = rebuilt.rate_limits.len(), "Added rate limit rule");
        Ok(rebuilt)
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

impl AppRegistry for InMemoryAppRegistry {
    fn lookup(&self, app_id: &str) -> Option<Arc<AppConfig>> {
        self.apps.get(app_id).map(|entry| entry.value().clone())
    }

    fn register(&self, config: AppConfig) -> Arc<AppConfig> {
        let config = Arc::new(config);
        self.apps.insert(config.app_id.clone(), config.clone());
        config
    }
}

/// Startup seed: applications plus optional sessions for the in-memory store.
#[derive(Debug, Default, Deserialize)]
pub struct Bootstrap {
    #[serde(default)]
    pub apps: Vec<AppDefinition>,
    #[serde(default)]
    pub sessions: Vec<SessionSeed>,
}

impl Bootstrap {
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RegistryError::Bootstrap(format!("{}: {e}", path.display())))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, RegistryError> {
        serde_json::from_str(raw).map_err(|e| RegistryError::Bootstrap(e.to_string()))
    }
}
