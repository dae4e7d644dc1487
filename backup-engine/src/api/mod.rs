//! HTTP API module for the backup engine.

pub mod health;
pub mod jobs;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::Config;
use crate::supervisor::JobSupervisor;
use crate::utils::errors::EngineError;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub supervisor: JobSupervisor,
    pub config: Arc<Config>,
}

/// Create shared application state
pub fn create_app_state(config: Config) -> AppState {
    AppState {
        supervisor: JobSupervisor::new(config.clone()),
        config: Arc::new(config),
    }
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        // Job endpoints
        .route("/api/jobs", post(jobs::submit_job).get(jobs::list_jobs))
        .route("/api/jobs/{id}", get(jobs::get_job))
        .route("/api/jobs/{id}/cancel", post(jobs::cancel_job))
        .route("/api/download", post(jobs::download))
        .route("/api/restore/upload", post(jobs::upload_restore))
        // WebSocket endpoint
        .route("/ws", get(crate::ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Engine errors as HTTP responses
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            EngineError::InvalidSpec(_) => StatusCode::BAD_REQUEST,
            EngineError::JobNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::JobInProgress(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (EngineError::InvalidSpec("x".into()), StatusCode::BAD_REQUEST),
            (EngineError::JobNotFound("x".into()), StatusCode::NOT_FOUND),
            (EngineError::JobInProgress("x".into()), StatusCode::CONFLICT),
            (EngineError::Cancelled, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }
}
