//! Job event fan-out and the WebSocket endpoint.
//!
//! - Engine → UI: progress snapshots, per-file events, log lines, final status
//! - UI → Engine: control commands (cancel)

pub mod handler;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, AppState};
use crate::job::{Direction, JobStatus};
use crate::policy::StageName;
use crate::transfer::progress::ProgressSnapshot;

/// Events pushed to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum JobEvent {
    #[serde(rename = "job:started")]
    Started {
        job_id: String,
        name: String,
        direction: Direction,
        units: usize,
    },

    #[serde(rename = "job:progress")]
    Progress(ProgressSnapshot),

    #[serde(rename = "job:file_started")]
    FileStarted { job_id: String, path: String, size: u64 },

    #[serde(rename = "job:file_completed")]
    FileCompleted { job_id: String, path: String, size: u64 },

    #[serde(rename = "job:file_failed")]
    FileFailed {
        job_id: String,
        path: String,
        stage: StageName,
        message: String,
    },

    /// Lifecycle messages and external-process stderr (level `stderr`)
    #[serde(rename = "job:log")]
    Log {
        job_id: String,
        level: String,
        message: String,
    },

    /// Terminal status with the full failure report
    #[serde(rename = "job:finished")]
    Finished(JobStatus),
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Started { job_id, .. }
            | JobEvent::FileStarted { job_id, .. }
            | JobEvent::FileCompleted { job_id, .. }
            | JobEvent::FileFailed { job_id, .. }
            | JobEvent::Log { job_id, .. } => job_id,
            JobEvent::Progress(snapshot) => &snapshot.job_id,
            JobEvent::Finished(status) => &status.job_id,
        }
    }
}

/// Broadcast channels: one for every event, one per live job.
///
/// Publishing never blocks; a lagging subscriber loses its oldest events.
#[derive(Clone)]
pub struct EventHub {
    all: broadcast::Sender<JobEvent>,
    jobs: Arc<DashMap<String, broadcast::Sender<JobEvent>>>,
    capacity: usize,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _rx) = broadcast::channel(capacity);
        Self {
            all,
            jobs: Arc::new(DashMap::new()),
            capacity,
        }
    }

    /// Open the per-job channel
    pub fn register(&self, job_id: &str) {
        self.jobs
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    /// Close the per-job channel; its subscribers see the end of the stream
    pub fn close(&self, job_id: &str) {
        self.jobs.remove(job_id);
    }

    pub fn publish(&self, event: JobEvent) {
        if let Some(tx) = self.jobs.get(event.job_id()) {
            let _ = tx.send(event.clone());
        }
        if let Err(e) = self.all.send(event) {
            debug!("No event subscribers: {:?}", e.0.job_id());
        }
    }

    pub fn log(&self, job_id: &str, level: &str, message: impl Into<String>) {
        self.publish(JobEvent::Log {
            job_id: job_id.to_string(),
            level: level.to_string(),
            message: message.into(),
        });
    }

    pub fn subscribe(&self, job_id: &str) -> Option<broadcast::Receiver<JobEvent>> {
        self.jobs.get(job_id).map(|tx| tx.subscribe())
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<JobEvent> {
        self.all.subscribe()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Incoming WebSocket commands
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WsCommand {
    #[serde(rename = "job:cancel")]
    CancelJob { job_id: String },
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub job_id: Option<String>,
}

/// WebSocket upgrade handler. `?job_id=` restricts the stream to one job.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(app_state): State<AppState>,
) -> Response {
    let rx = match &params.job_id {
        Some(job_id) => match app_state.supervisor.subscribe(job_id) {
            Ok(rx) => rx,
            Err(e) => return ApiError::from(e).into_response(),
        },
        None => app_state.supervisor.subscribe_all(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, rx, app_state))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, mut rx: broadcast::Receiver<JobEvent>, state: AppState) {
    info!("New WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();

    // Forward events to this client
    let mut send_task = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("WebSocket subscriber lagged, dropped {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize event: {:?}", e);
                }
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    // Handle incoming commands from the client
    let supervisor = state.supervisor.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<WsCommand>(&text) {
                    Ok(command) => handler::handle_command(command, &supervisor),
                    Err(e) => {
                        warn!("Failed to parse WebSocket command: {:?}", e);
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("WebSocket client disconnected");
}
