use std::backtrace::Backtrace;
use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use edge_gateway::middleware::recovery::panic_message;
use edge_gateway::{AppState, Config, TracingLogger, build_router, metrics};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from_env();

    // Logging needs the configuration; fall back to defaults so a
    // configuration error can still be reported.
    let (log_level, log_json) = match &config {
        Ok(c) => (c.log_level.as_str(), c.log_json),
        Err(_) => ("info", false),
    };
    init_tracing(log_level, log_json);
    install_panic_hook();

    info!("Starting Edge Gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            return ExitCode::from(exitcode::CONFIG as u8);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    if json {
        builder.json().with_current_span(true).init();
    } else {
        builder.init();
    }
}

/// Log every panic with its location and a backtrace. The hook runs on the
/// panicking task, so the entry lands inside that request's span; the
/// recovery stage then answers the 500.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        let backtrace = Backtrace::force_capture();

        error!(
            panic = panic_message(info.payload()),
            location = %location,
            backtrace = %backtrace,
            "Panic in request handling"
        );
    }));
}

/// Run the gateway, returning an exit code on error.
async fn run(config: Config) -> Result<(), exitcode::ExitCode> {
    info!(
        host = %config.host,
        port = %config.port,
        environment = %config.environment,
        routes = config.routes.len(),
        "Configuration loaded"
    );
    if config.routes.is_empty() {
        warn!("No routes configured (GATEWAY_ROUTES); every proxied request will answer 404");
    }

    if let Some(addr) = config.metrics_addr() {
        metrics::try_init_metrics(addr);
    }

    let state = AppState::new(config.clone(), TracingLogger::shared()).map_err(|e| {
        error!("Failed to build gateway state: {e}");
        exitcode::CONFIG
    })?;
    let app = build_router(&state);

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Gateway listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    info!("Gateway shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
///
/// A signal whose handler cannot be installed is logged and never fires;
/// the other one still triggers shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
