//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! On a signal every active job is cancelled, and the engine waits (bounded)
//! for them to reach a terminal state so no `.partial` artifact or external
//! process is left behind.

use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::supervisor::JobSupervisor;

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    supervisor: JobSupervisor,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(supervisor: JobSupervisor, grace: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            supervisor,
            grace,
        }
    }

    /// Get a shutdown receiver
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Wait for shutdown signal (SIGTERM or SIGINT)
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }
    }

    /// Tell subscribers (the HTTP server) to stop
    pub fn trigger(&self) {
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to broadcast shutdown signal: {}", e);
        }
    }

    /// Cancel every active job and wait for them to settle
    pub async fn shutdown(&self) -> bool {
        info!("Graceful shutdown initiated");

        let cancelled = self.supervisor.cancel_all();
        if cancelled > 0 {
            info!("Cancelled {} active job(s)", cancelled);
        }

        let idle = self.supervisor.wait_idle(self.grace).await;
        if idle {
            info!("Graceful shutdown complete");
        } else {
            warn!("Jobs still running after {:?}, exiting anyway", self.grace);
        }
        idle
    }
}
