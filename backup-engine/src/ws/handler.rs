//! WebSocket command handlers.

use super::WsCommand;
use crate::supervisor::JobSupervisor;
use tracing::{info, warn};

/// Handle a command received from a UI client
pub fn handle_command(command: WsCommand, supervisor: &JobSupervisor) {
    match command {
        WsCommand::CancelJob { job_id } => handle_cancel_job(&job_id, supervisor),
    }
}

fn handle_cancel_job(job_id: &str, supervisor: &JobSupervisor) {
    info!("Received cancel command for job: {}", job_id);

    if let Err(e) = supervisor.cancel(job_id) {
        warn!("Cancel command for {} ignored: {}", job_id, e);
    }
}
