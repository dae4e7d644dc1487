//! Backup Engine - Main entry point
//!
//! Serves the job API and the event WebSocket.

use anyhow::Result;
use backup_engine::{api, config::Config, daemon::ShutdownCoordinator, utils};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Time given to running jobs to settle after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = match args.config {
        Some(config_path) => Config::from_file(&config_path)?,
        None => Config::default(),
    }
    .with_env_overrides();
    config.validate()?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    // Initialize start time for uptime tracking
    api::health::init_start_time();

    tracing::info!("Starting backup-engine v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Backups directory: {}", config.paths.backups_dir.display());
    for (tool, program) in config.tools.missing() {
        tracing::warn!("{} not found at {}, jobs using it will fail", tool, program.display());
    }

    // Determine address
    let port = args.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", config.server.host, port).parse()?;

    let app_state = api::create_app_state(config);
    let shutdown_coordinator = ShutdownCoordinator::new(app_state.supervisor.clone(), SHUTDOWN_GRACE);
    let app = api::create_router(app_state);

    tracing::info!("Listening on http://{}", addr);
    tracing::info!("Jobs endpoint: http://{}/api/jobs", addr);
    tracing::info!("WebSocket endpoint: ws://{}/ws", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let mut stop = shutdown_coordinator.subscribe();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = stop.recv().await;
    });
    let server_handle = tokio::spawn(async move { server.await });

    // Wait for shutdown signal
    shutdown_coordinator.wait_for_signal().await;

    // Jobs first, then the server
    shutdown_coordinator.shutdown().await;
    shutdown_coordinator.trigger();

    // Wait for server to finish (with timeout)
    match tokio::time::timeout(Duration::from_secs(5), server_handle).await {
        Ok(Ok(Ok(()))) => tracing::info!("Server shutdown complete"),
        Ok(Ok(Err(e))) => tracing::error!("Server error during shutdown: {}", e),
        Ok(Err(e)) => tracing::error!("Server task panicked: {}", e),
        Err(_) => tracing::warn!("Server shutdown timeout, forcing exit"),
    }

    Ok(())
}
