//! Ensemble server
//!
//! Runs the WebSocket coordinator over the project directory seeded from
//! `ENSEMBLE_DIRECTORY`. Hosts create and steer sessions with management
//! frames on their own connection; embedding applications can do the same
//! through [`Coordinator`](ensemble::Coordinator).
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing (JSON when `ENSEMBLE_LOG_JSON` is set)
//! 3. Bind the WebSocket listener
//! 4. Accept connections until SIGINT or SIGTERM

use ensemble::{EnsembleConfig, EnsembleServer, logging};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = EnsembleConfig::from_env();
    logging::init(config.as_ref().is_ok_and(|c| c.log_json));

    info!("Starting Ensemble server");

    let config = config.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        rtc_token_ttl_seconds = config.rtc_token_ttl_seconds,
        join_request_ttl_seconds = config.join_request_ttl_seconds,
        sweep_interval_seconds = config.sweep_interval_seconds,
        outbox_capacity = config.outbox_capacity,
        idle_timeout_seconds = config.idle_timeout_seconds,
        directory_entries = config.directory.len(),
        "Configuration loaded successfully"
    );

    let server = EnsembleServer::builder(config).build().await.map_err(|e| {
        error!(error = %e, "Failed to start server");
        e
    })?;
    info!(addr = %server.local_addr()?, "Ensemble server listening");

    server.run_until(shutdown_signal()).await?;

    info!("Ensemble server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
