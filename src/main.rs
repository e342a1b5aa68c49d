use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info};

use omnibus::logging::{self, LogSettings};
use omnibus::{AppState, Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    // Configuration first: it decides how the root logger is built
    let config = Config::from_env().map_err(|e| {
        logging::root();
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    logging::init(LogSettings::from(&config));

    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    info!(
        host = %config.host,
        port = %config.port,
        requests_per_window = config.pipeline.rate_limit.requests_per_window,
        timeout_ms = config.pipeline.timeout.as_millis() as u64,
        trusted_proxies = config.trusted_proxies.len(),
        "Configuration loaded"
    );

    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    } else {
        info!("Metrics endpoint disabled (METRICS_PORT=0)");
    }

    let state = AppState::new(config.clone());
    let app = build_router(state).map_err(|e| {
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
    info!("  GET  /                   - Plain OK");
    info!("  GET  /health             - Health check");
    info!("  GET  /fail               - Unhandled failure (500)");
    info!("  GET  /bad-request/{{*}}    - Labeled failure (400)");
    info!("  GET  /slow?ms=N          - Sleeps N ms (408 past the deadline)");
    info!("  GET  /context            - Echoes the correlation id");

    // Client keys come from the socket address, so serve with ConnectInfo
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

    info!("Server shutdown complete");
    Ok(())
}
