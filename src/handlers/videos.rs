// src/handlers/videos.rs
//! Video generation endpoints - submit, status, cancel, live progress, content

use crate::jobs::{JobId, VideoJob};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, Path,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use video_lab::{
    ErrorReport, GenerationOptions, JobRequest, Phase, TrackerState, VideoOperation,
};

pub const KEY_NOT_SELECTED: &str = "API Key not selected. Please select a key to generate videos.";

#[derive(Deserialize)]
pub struct GenerateVideoRequest {
    pub prompt: String,
    #[serde(flatten)]
    pub options: GenerationOptions,
}

/// What the UI renders for one job
#[derive(Debug, Serialize)]
pub struct VideoJobView {
    pub job_id: JobId,
    pub prompt: String,
    pub phase: Phase,
    pub status_message: &'static str,
    pub error: Option<ErrorReport>,
    pub video_url: Option<String>,
    pub cancelled: bool,
    pub polls: u32,
    pub credential_invalidated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VideoJobView {
    pub fn new(job: &VideoJob, state: &TrackerState<VideoOperation>) -> Self {
        Self {
            job_id: job.id.clone(),
            prompt: job.request.prompt().to_string(),
            phase: state.phase,
            status_message: status_message(state),
            error: state.last_error.as_ref().map(ErrorReport::from),
            video_url: state
                .result_uri()
                .map(|_| format!("/api/videos/{}/content", job.id)),
            cancelled: state.cancelled,
            polls: state.polls,
            credential_invalidated: state.credential_invalidated,
            created_at: job.created_at,
            updated_at: state.updated_at,
        }
    }

    pub fn from_job(job: &VideoJob) -> Self {
        Self::new(job, &job.tracker.state())
    }
}

fn status_message(state: &TrackerState<VideoOperation>) -> &'static str {
    if state.cancelled {
        return "Video generation cancelled.";
    }
    match state.phase {
        Phase::Idle => "",
        Phase::Submitting => "Initializing video generation...",
        Phase::Polling => "Creating your video. This can take a few minutes...",
        Phase::Completed => "Video generation complete!",
        Phase::Failed => "An error occurred.",
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// POST /api/videos - Start a video generation job
pub async fn create_video(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<GenerateVideoRequest>,
) -> Response {
    let request = match JobRequest::new(body.prompt, body.options) {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    if !state.credentials.is_present() {
        tracing::warn!("Video generation requested without a selected API key");
        return error_response(StatusCode::PRECONDITION_FAILED, KEY_NOT_SELECTED);
    }

    let tracker = state.video_tracker.submit(request.clone());
    let job = state.job_manager.create_job(request, tracker).await;

    (StatusCode::ACCEPTED, Json(VideoJobView::from_job(&job))).into_response()
}

/// GET /api/videos - All known jobs, newest first
pub async fn list_videos(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    let jobs: Vec<VideoJobView> = state
        .job_manager
        .list_jobs()
        .await
        .iter()
        .map(VideoJobView::from_job)
        .collect();
    Json(serde_json::json!({ "job_count": jobs.len(), "jobs": jobs }))
}

/// GET /api/videos/:job_id - Current state of a job
pub async fn get_video(
    Path(job_id): Path<JobId>,
    Extension(state): Extension<Arc<AppState>>,
) -> Response {
    match state.job_manager.get_job(&job_id).await {
        Some(job) => Json(VideoJobView::from_job(&job)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Job not found"),
    }
}

/// POST /api/videos/:job_id/cancel - Abandon a job
pub async fn cancel_video(
    Path(job_id): Path<JobId>,
    Extension(state): Extension<Arc<AppState>>,
) -> Response {
    match state.job_manager.cancel_job(&job_id).await {
        Some(job) => Json(VideoJobView::from_job(&job)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Job not found"),
    }
}

/// GET /api/videos/:job_id/content - Proxy the finished video so the key stays server-side
pub async fn video_content(
    Path(job_id): Path<JobId>,
    Extension(state): Extension<Arc<AppState>>,
) -> Response {
    let Some(job) = state.job_manager.get_job(&job_id).await else {
        return error_response(StatusCode::NOT_FOUND, "Job not found");
    };

    let Some(uri) = job.tracker.state().result_uri().map(str::to_string) else {
        return error_response(StatusCode::CONFLICT, "Video is not ready");
    };

    match state.gemini_client.download_video(&uri).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "video/mp4")], bytes).into_response(),
        Err(e) => {
            tracing::error!("Failed to download video for job {}: {}", job_id, e);
            error_response(StatusCode::BAD_GATEWAY, format!("Failed to download video: {}", e))
        }
    }
}

/// GET /api/videos/:job_id/ws - Push the job view on every transition
pub async fn video_progress_ws(
    ws: WebSocketUpgrade,
    Path(job_id): Path<JobId>,
    Extension(state): Extension<Arc<AppState>>,
) -> Response {
    match state.job_manager.get_job(&job_id).await {
        Some(job) => ws.on_upgrade(move |socket| stream_progress(socket, job)),
        None => error_response(StatusCode::NOT_FOUND, "Job not found"),
    }
}

async fn stream_progress(socket: WebSocket, job: VideoJob) {
    let (sender, receiver) = socket.split();
    pump_progress(sender, receiver, job).await;
}

/// Send the job view on every transition; a "cancel" text frame cancels the job
async fn pump_progress<S, R>(mut sender: S, mut receiver: R, job: VideoJob)
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut updates = job.tracker.subscribe();
    tracing::info!("🔌 Progress stream opened for job: {}", job.id);

    loop {
        let (view, settled) = {
            let state = updates.borrow_and_update();
            (VideoJobView::new(&job, &state), state.is_settled())
        };

        let Ok(payload) = serde_json::to_string(&view) else {
            break;
        };
        if sender.send(Message::Text(payload)).await.is_err() {
            tracing::debug!("Progress stream for job {} closed by client", job.id);
            return;
        }
        if settled {
            break;
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) if text.trim() == "cancel" => {
                    job.tracker.cancel();
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    tracing::debug!("Progress stream for job {} ended by client", job.id);
                    return;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    tracing::info!("🔌 Progress stream finished for job: {}", job.id);
}

/// Routes for video generation
pub fn video_routes() -> Router {
    Router::new()
        .route("/api/videos", post(create_video).get(list_videos))
        .route("/api/videos/:job_id", get(get_video))
        .route("/api/videos/:job_id/cancel", post(cancel_video))
        .route("/api/videos/:job_id/content", get(video_content))
        .route("/api/videos/:job_id/ws", get(video_progress_ws))
}
