use std::net::SocketAddr;
use std::process::ExitCode;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use parse_gate::config::LogFormat;
use parse_gate::{AppState, Bootstrap, Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(Config::default().log_filter(), LogFormat::default());
            error!("Configuration error: {e}");
            return ExitCode::from(exitcode::CONFIG as u8);
        }
    };
    init_tracing(config.log_filter(), config.log_format);

    info!("Starting Parse Gate v{}", env!("CARGO_PKG_VERSION"));

    match run(config).await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

fn init_tracing(filter: EnvFilter, format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn load_bootstrap(config: &Config) -> anyhow::Result<Bootstrap> {
    match &config.apps_config_path {
        Some(path) => Bootstrap::load(path)
            .with_context(|| format!("failed to load applications from {}", path.display())),
        None => {
            warn!("APPS_CONFIG_PATH not set, starting with no registered applications");
            Ok(Bootstrap::default())
        }
    }
}

/// Run the application, returning an exit code on error.
async fn run(config: Config) -> Result<(), exitcode::ExitCode> {
    info!(
        host = %config.host,
        port = %config.port,
        trusted_proxies = config.trusted_proxies.len(),
        collaborator_timeout_ms = config.collaborator_timeout.as_millis() as u64,
        log_level = %config.log_level,
        log_format = %config.log_format,
        "Configuration loaded"
    );

    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    }

    let bootstrap = load_bootstrap(&config).map_err(|e| {
        error!("Bootstrap error: {e:#}");
        exitcode::CONFIG
    })?;
    info!(
        apps = bootstrap.apps.len(),
        sessions = bootstrap.sessions.len(),
        "Bootstrap loaded"
    );

    let state = AppState::new(config.clone(), bootstrap).map_err(|e| {
        error!("Failed to register applications: {e}");
        exitcode::CONFIG
    })?;
    let app = build_router(state.clone());

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET  /health           - Health check (no admission)");
    info!("  GET  /serverInfo       - Server info (master key)");
    info!("  *    /*                - Admitted and echoed");

    // Peer addresses feed client IP resolution
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
