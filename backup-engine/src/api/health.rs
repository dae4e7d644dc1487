//! Health check endpoints.

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use std::sync::OnceLock;
use std::time::Instant;

use super::AppState;

static START_TIME: OnceLock<Instant> = OnceLock::new();

pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

/// GET /health - Health check endpoint
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0);

    let missing_tools: Vec<&str> = state.config.tools.missing().into_iter().map(|(tool, _)| tool).collect();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime,
        "active_jobs": state.supervisor.active_count(),
        "missing_tools": missing_tools,
    }))
}

/// GET /version - Version information endpoint
pub async fn version(State(state): State<AppState>) -> impl IntoResponse {
    let mut features = vec!["zstd", "age", "gpg", "split", "download", "upload"];
    if state.config.tools.zstd.is_some() {
        features.push("external-zstd");
    }

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "features": features,
    }))
}
