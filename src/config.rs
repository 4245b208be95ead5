//! Server configuration loaded from environment variables.
//!
//! All settings have development defaults. In production, configure via
//! environment variables or a `.env` file.
//!
//! # Applications
//!
//! - `APPS_CONFIG_PATH`: JSON file with `{"apps": [...], "sessions": [...]}`
//!   loaded into the registry and session store at startup
//!
//! # Security
//!
//! - `TRUSTED_PROXIES`: Comma-separated addresses or CIDR ranges whose
//!   `X-Forwarded-For` / `X-Real-IP` headers are believed
//! - `CORS_ALLOWED_ORIGINS`: Comma-separated origins (default: `*`)
//! - `CORS_ALLOW_HEADERS`: Extra request headers allowed on top of the
//!   built-in `X-Parse-*` set
//!
//! # Timeouts and Housekeeping
//!
//! - `COLLABORATOR_TIMEOUT_MS`: Bound on each session, counting-store and
//!   record-store call (default: 10000)
//! - `REAPER_INTERVAL_SECS`: How often expired records, sessions and stale
//!   rate-limit keys are dropped (default: 60)

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
#[error("Configuration error: {0}")]
pub struct ConfigError(pub String);

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server
    // =========================================================================
    /// Bind address (default: "0.0.0.0")
    pub host: String,

    /// Bind port (default: 1337)
    pub port: u16,

    /// Largest request body admission will buffer (default: 20 MiB)
    pub max_request_body_size: usize,

    // =========================================================================
    // Applications
    // =========================================================================
    /// Bootstrap file with app definitions and seed sessions
    pub apps_config_path: Option<PathBuf>,

    // =========================================================================
    // Security
    // =========================================================================
    pub cors_allowed_origins: Vec<String>,

    /// Extra CORS request headers beyond the built-in set
    pub cors_allow_headers: Vec<String>,

    /// Proxies whose forwarding headers are trusted (empty = trust none
    /// when the peer address is known)
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Timeouts and housekeeping
    // =========================================================================
    pub collaborator_timeout: Duration,
    pub reaper_interval: Duration,

    // =========================================================================
    // Observability
    // =========================================================================
    /// `RUST_LOG` filter (default: "info")
    pub log_level: String,
    pub log_format: LogFormat,

    /// Prometheus listener port (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from the environment, reading `.env` first if present.
    pub fn from_env() -> ConfigResult<Self> {
        let _ = dotenvy::dotenv();

        let config = Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 1337)?,
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 20 * 1024 * 1024)?,

            apps_config_path: env::var("APPS_CONFIG_PATH")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),

            cors_allowed_origins: Self::parse_list("CORS_ALLOWED_ORIGINS", "*"),
            cors_allow_headers: Self::parse_list("CORS_ALLOW_HEADERS", ""),
            trusted_proxies: Self::parse_list("TRUSTED_PROXIES", ""),

            collaborator_timeout: Duration::from_millis(Self::parse_env(
                "COLLABORATOR_TIMEOUT_MS",
                10_000,
            )?),
            reaper_interval: Duration::from_secs(Self::parse_env("REAPER_INTERVAL_SECS", 60)?),

            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: Self::parse_env("LOG_FORMAT", LogFormat::Pretty)?,
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_request_body_size == 0 {
            return Err(ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }
        if self.collaborator_timeout.is_zero() {
            return Err(ConfigError(
                "COLLABORATOR_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }
        if self.reaper_interval.is_zero() {
            return Err(ConfigError(
                "REAPER_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }
        if let Some(bad) = self
            .cors_allow_headers
            .iter()
            .find(|h| axum::http::HeaderName::from_bytes(h.as_bytes()).is_err())
        {
            return Err(ConfigError(format!(
                "CORS_ALLOW_HEADERS contains an invalid header name: {bad:?}"
            )));
        }
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// `None` when metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_enabled()
            .then(|| SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }

    /// Tracing filter built from `log_level`. An unparseable directive
    /// falls back to `info`.
    pub fn log_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    }

    fn parse_env<T>(name: &str, default: T) -> ConfigResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Comma-separated list with empty entries dropped.
    fn parse_list(name: &str, default: &str) -> Vec<String> {
        split_list(&env::var(name).unwrap_or_else(|_| default.to_string()))
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Development defaults, also used by tests.
impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1337,
            max_request_body_size: 20 * 1024 * 1024,
            apps_config_path: None,
            cors_allowed_origins: vec!["*".to_string()],
            cors_allow_headers: vec![],
            trusted_proxies: vec![],
            collaborator_timeout: Duration::from_secs(10),
            reaper_interval: Duration::from_secs(60),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_port: 9090,
        }
    }
}
