use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gatekeep::{Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from_env();

    // Initialize logging; a broken config still gets `info` logs to report it.
    let filter = config
        .as_ref()
        .map_or_else(|_| EnvFilter::new("info"), Config::log_filter);
    init_tracing(filter, config.as_ref().is_ok_and(|c| c.log_json));

    info!("Starting gatekeep v{}", env!("CARGO_PKG_VERSION"));

    match run(config).await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

fn init_tracing(filter: EnvFilter, json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Run the application, returning an exit code on error.
async fn run(config: gatekeep::AppResult<Config>) -> Result<(), exitcode::ExitCode> {
    let config = config.map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        host = %config.host,
        port = %config.port,
        admission = %config.admission_mode,
        deadline_ms = config.request_deadline_ms,
        "Configuration loaded"
    );

    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    }

    // Parent of every request's cancellation token.
    let shutdown = CancellationToken::new();

    let app = build_router(&config, shutdown.clone()).map_err(|e| {
        error!("Failed to build router: {e}");
        exitcode::CONFIG
    })?;

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("Endpoints:");
    info!("  GET  /health       - Health check");
    info!("  GET  /whoami       - Resolved client address");
    info!("  GET  /slow?ms=N    - Sleep N ms, honoring cancellation");

    // Peer addresses feed the client address fallback.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal(shutdown))
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    info!("Server shutdown complete");
    Ok(())
}
