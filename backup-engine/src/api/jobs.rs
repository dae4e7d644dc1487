//! Job submission, status and cancellation endpoints.

use axum::{
    body::Body,
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc;

use super::{ApiError, AppState};
use crate::job::{Direction, JobSpec, JobState, JobStatus, Secret};
use crate::policy::ErrorPolicy;
use crate::supervisor::JobSupervisor;

/// Passphrase or identity for an uploaded encrypted archive
const SECRET_HEADER: &str = "x-backup-secret";

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
}

/// POST /api/jobs - Validate and start a job
pub async fn submit_job(
    State(state): State<AppState>,
    Json(spec): Json<JobSpec>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    tracing::info!("Submitting {:?} job '{}'", spec.direction, spec.name);
    let job_id = state.supervisor.submit(spec)?;
    Ok((StatusCode::ACCEPTED, Json(SubmitJobResponse { job_id })))
}

/// Restore options of an upload, carried in the query string
#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub file_name: String,
    #[serde(default)]
    pub name: String,
    pub destination: Option<PathBuf>,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

/// POST /api/restore/upload - Restore from an archive sent as the request body
pub async fn upload_restore(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    request: Request,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    tracing::info!("Receiving upload {} for restore", params.file_name);

    let secret = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(Secret::new);
    let spec = JobSpec {
        name: params.name,
        direction: Direction::Restore,
        destination: params.destination,
        error_policy: params.error_policy,
        secret,
        ..Default::default()
    };

    let body = request.into_body().into_data_stream();
    let job_id = state.supervisor.submit_upload(spec, &params.file_name, body).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitJobResponse { job_id })))
}

/// GET /api/jobs - Every known job
pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobStatus>> {
    Json(state.supervisor.list())
}

/// GET /api/jobs/{id}
pub async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<JobStatus>, ApiError> {
    Ok(Json(state.supervisor.status(&id)?))
}

/// POST /api/jobs/{id}/cancel - Idempotent cancel
pub async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<JobStatus>, ApiError> {
    tracing::info!("Cancelling job: {}", id);
    Ok(Json(state.supervisor.cancel(&id)?))
}

/// POST /api/download - Stream a backup archive to the client
pub async fn download(State(state): State<AppState>, Json(spec): Json<JobSpec>) -> Result<Response, ApiError> {
    let handle = state.supervisor.submit_download(spec)?;
    tracing::info!("Streaming job {} as {}", handle.job_id, handle.file_name);

    let body = Body::from_stream(archive_stream(state.supervisor.clone(), handle.job_id.clone(), handle.body));
    let disposition = format!("attachment; filename=\"{}\"", handle.file_name);

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

struct DownloadState {
    supervisor: JobSupervisor,
    job_id: String,
    rx: Option<mpsc::Receiver<Bytes>>,
}

/// Archive chunks, then an error if the job did not complete so the client
/// sees a truncated transfer instead of a short archive.
fn archive_stream(
    supervisor: JobSupervisor,
    job_id: String,
    rx: mpsc::Receiver<Bytes>,
) -> impl futures_util::Stream<Item = std::io::Result<Bytes>> {
    let state = DownloadState {
        supervisor,
        job_id,
        rx: Some(rx),
    };

    stream::unfold(state, |mut state| async move {
        let mut rx = state.rx.take()?;
        match rx.recv().await {
            Some(chunk) => {
                state.rx = Some(rx);
                Some((Ok(chunk), state))
            }
            None => {
                let failure = match state.supervisor.wait(&state.job_id).await {
                    Ok(status) if matches!(status.state, JobState::Completed | JobState::CompletedWithFailures) => {
                        return None
                    }
                    Ok(status) => status.summary,
                    Err(e) => e.to_string(),
                };
                tracing::warn!("Download {} ended early: {}", state.job_id, failure);
                Some((Err(std::io::Error::other(failure)), state))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::create_router;
    use crate::config::Config;
    use axum::http::Request;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn state(dir: &TempDir) -> AppState {
        let mut config = Config::default();
        config.paths.backups_dir = dir.path().join("backups");
        config.paths.restore_dir = dir.path().join("restore");
        config.paths.staging_dir = dir.path().join("staging");
        AppState {
            supervisor: JobSupervisor::new(config.clone()),
            config: Arc::new(config),
        }
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_submit_then_status() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.txt"), b"alpha").unwrap();

        let state = state(&dir);
        let supervisor = state.supervisor.clone();
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(post_json("/api/jobs", serde_json::json!({"name": "api", "paths": [src]})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let job_id = json_body(response).await["job_id"].as_str().unwrap().to_string();

        let status = supervisor.wait(&job_id).await.unwrap();
        assert_eq!(status.state, JobState::Completed);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/jobs/{}", job_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["state"], "completed");
        assert_eq!(body["files_processed"], 1);
    }

    #[tokio::test]
    async fn test_invalid_spec_and_unknown_job() {
        let dir = TempDir::new().unwrap();
        let app = create_router(state(&dir));

        let response = app
            .clone()
            .oneshot(post_json("/api/jobs", serde_json::json!({"paths": []})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["error"].as_str().is_some());

        let response = app
            .oneshot(post_json("/api/jobs/missing/cancel", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_download_streams_archive() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.txt"), b"alpha").unwrap();

        let app = create_router(state(&dir));
        let response = app
            .oneshot(post_json("/api/download", serde_json::json!({"name": "dl", "paths": [src]})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"dl.tar.zst\""
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let tar_bytes = zstd::decode_all(bytes.as_ref()).unwrap();
        let mut archive = tar::Archive::new(tar_bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["src", "src/a.txt"]);
    }

    #[tokio::test]
    async fn test_health_reports_active_jobs() {
        let dir = TempDir::new().unwrap();
        let app = create_router(state(&dir));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_jobs"], 0);
    }

    fn zstd_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, body) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            builder.append_data(&mut header, name, *body).unwrap();
        }
        zstd::encode_all(builder.into_inner().unwrap().as_slice(), 3).unwrap()
    }

    #[tokio::test]
    async fn test_uploaded_archive_is_restored_then_removed() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let supervisor = state.supervisor.clone();
        let app = create_router(state);

        let dest = dir.path().join("restored");
        let uri = format!("/api/restore/upload?file_name=notes.tar.zst&destination={}", dest.display());
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::from(zstd_tar(&[("notes/todo.txt", b"ship it")])))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let job_id = json_body(response).await["job_id"].as_str().unwrap().to_string();

        let status = supervisor.wait(&job_id).await.unwrap();
        assert_eq!(status.state, JobState::Completed, "{}", status.summary);
        assert_eq!(std::fs::read(dest.join("notes/todo.txt")).unwrap(), b"ship it");

        // Staged copy is gone once the job is over
        let staged: Vec<_> = std::fs::read_dir(dir.path().join("staging")).unwrap().collect();
        assert!(staged.is_empty());
    }

    #[tokio::test]
    async fn test_failed_upload_restore_still_removes_staged_archive() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let supervisor = state.supervisor.clone();
        let app = create_router(state);

        let dest = dir.path().join("restored");
        let uri = format!("/api/restore/upload?file_name=junk.tar.zst&destination={}", dest.display());
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::from("not an archive"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let job_id = json_body(response).await["job_id"].as_str().unwrap().to_string();

        let status = supervisor.wait(&job_id).await.unwrap();
        assert_eq!(status.state, JobState::Failed);
        let staged: Vec<_> = std::fs::read_dir(dir.path().join("staging")).unwrap().collect();
        assert!(staged.is_empty());
    }

    #[tokio::test]
    async fn test_empty_upload_is_rejected() {
        let dir = TempDir::new().unwrap();
        let app = create_router(state(&dir));

        let request = Request::builder()
            .method("POST")
            .uri("/api/restore/upload?file_name=a.tar.zst")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_split_download_streams_one_bundle() {
        let dir = TempDir::new().unwrap();
        let media = dir.path().join("media");
        std::fs::create_dir_all(media.join("music")).unwrap();
        std::fs::create_dir_all(media.join("video")).unwrap();
        std::fs::write(media.join("music/song.flac"), b"la la").unwrap();
        std::fs::write(media.join("video/clip.mkv"), b"frames").unwrap();

        let app = create_router(state(&dir));
        let response = app
            .oneshot(post_json(
                "/api/download",
                serde_json::json!({"name": "media", "paths": [media], "split": true}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"media_subdirs.tar\""
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let mut bundle = tar::Archive::new(bytes.as_ref());
        let mut units = Vec::new();
        for entry in bundle.entries().unwrap() {
            use std::io::Read;

            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            let mut compressed = Vec::new();
            entry.read_to_end(&mut compressed).unwrap();
            let tar_bytes = zstd::decode_all(compressed.as_slice()).unwrap();
            let inner: Vec<String> = tar::Archive::new(tar_bytes.as_slice())
                .entries()
                .unwrap()
                .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
                .collect();
            units.push((name, inner));
        }

        assert_eq!(
            units,
            vec![
                ("media_music.tar.zst".to_string(), vec!["music".to_string(), "music/song.flac".to_string()]),
                ("media_video.tar.zst".to_string(), vec!["video".to_string(), "video/clip.mkv".to_string()]),
            ]
        );
        // Nothing lands in the backups directory
        assert!(!dir.path().join("backups/media_music.tar.zst").exists());
    }

    #[tokio::test]
    async fn test_health_reports_missing_tools() {
        let dir = TempDir::new().unwrap();
        let mut state = state(&dir);
        let mut config = (*state.config).clone();
        config.tools.gpg = dir.path().join("no-such-gpg");
        state.config = Arc::new(config);
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        let missing = body["missing_tools"].as_array().unwrap();
        assert!(missing.iter().any(|tool| tool == "gpg"));
    }
}
