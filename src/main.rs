//! gecho: an echo server for testing TCP connectivity.
//!
//! Usage: `gecho start [--port 8080] [--interface 0.0.0.0] [--verbose]`
//!
//! Runs until SIGINT or SIGTERM, then stops accepting and waits for open
//! connections to finish before exiting.

use gecho::{Config, Server};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        max_line_length = config.max_line_length,
        workers = ?config.workers,
        "Starting gecho server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Arc::new(Server::with_config(config));

    let stopper = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            shutdown_signal().await;
            // A signal during bind must still stop the server once it is live.
            server.wait_started().await;
            if let Err(e) = server.stop().await {
                error!(error = %e, "Shutdown did not complete cleanly");
            }
        })
    };

    if let Err(e) = server.start().await {
        stopper.abort();
        return Err(e.into());
    }

    // start() returns once the listener is closed; wait for the drain.
    stopper.await?;
    info!("Server stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }
}
