//! HTTP surface.
//!
//! Thin axum handlers over the shared [`AppContext`]: request validation,
//! idempotency gating, artifact reads, retrieval, and progress streaming.
//! Every error is a `{"detail": CODE}` body with the matching status code.

mod artifacts;
mod events;
mod jobs;
mod keyframes;
mod prefs;
mod retrieval;
mod videos;

use crate::app::AppContext;
use crate::error::{Result, SiktError};
use crate::worker::JobWorker;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::info;

/// Error shape shared by every handler: status code plus a stable detail
/// string.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }
}

impl From<SiktError> for ApiError {
    fn from(e: SiktError) -> Self {
        match &e {
            SiktError::VectorStore(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "E_VECTOR_STORE_UNAVAILABLE")
            }
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        SiktError::from(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "detail": self.detail })),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// `202 Accepted` body used by the idempotency gates.
pub(crate) fn accepted(detail: &str, job_id: &str, video_id: &str) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "detail": detail,
            "job_id": job_id,
            "video_id": video_id,
        })),
    )
        .into_response()
}

/// Look up a video or fail with `VIDEO_NOT_FOUND`.
pub(crate) fn require_video(
    ctx: &AppContext,
    video_id: &str,
) -> ApiResult<crate::store::Video> {
    ctx.store
        .get_video(video_id)?
        .ok_or_else(|| ApiError::not_found("VIDEO_NOT_FOUND"))
}

/// Build the full application router.
pub fn router(ctx: Arc<AppContext>) -> Router {
    let mut app = Router::new()
        .route("/health", get(prefs::health))
        .route("/models", get(prefs::get_models))
        .route(
            "/llm/preferences/default",
            get(prefs::get_llm_preferences).put(prefs::put_llm_preferences),
        )
        .route("/llm/providers", get(prefs::list_llm_providers))
        .route("/llm/local/status", get(prefs::llm_local_status))
        .route(
            "/runtime/profile",
            get(prefs::get_runtime_profile).put(prefs::put_runtime_profile),
        )
        .route("/summaries/cloud", post(prefs::cloud_summary))
        .route("/videos/import", post(videos::import_video))
        .route("/videos", get(videos::list_videos))
        .route("/videos/{video_id}", get(videos::get_video))
        .route("/videos/{video_id}/file", get(videos::get_video_file))
        .route("/videos/{video_id}/transcript", get(videos::get_transcript))
        .route(
            "/videos/{video_id}/subtitles/{fmt}",
            get(videos::export_subtitles),
        )
        .route(
            "/videos/{video_id}/index",
            get(artifacts::get_index_status).post(artifacts::create_index_job),
        )
        .route(
            "/videos/{video_id}/summarize",
            post(artifacts::create_summarize_job),
        )
        .route("/videos/{video_id}/summary", get(artifacts::get_summary))
        .route("/videos/{video_id}/outline", get(artifacts::get_outline))
        .route(
            "/videos/{video_id}/export/markdown",
            get(artifacts::export_summary_markdown),
        )
        .route("/videos/{video_id}/chunks", get(artifacts::list_chunks))
        .route(
            "/videos/{video_id}/keyframes",
            get(keyframes::list_keyframes).post(keyframes::create_keyframes_job),
        )
        .route(
            "/videos/{video_id}/keyframes/index",
            get(keyframes::get_keyframes_index),
        )
        .route(
            "/videos/{video_id}/keyframes/nearest",
            get(keyframes::nearest_keyframe),
        )
        .route(
            "/videos/{video_id}/keyframes/aligned",
            get(keyframes::aligned_keyframes),
        )
        .route(
            "/videos/{video_id}/keyframes/{keyframe_id}/image",
            get(keyframes::get_keyframe_image),
        )
        .route("/jobs/transcribe", post(jobs::create_transcribe_job))
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/{job_id}", get(jobs::get_job))
        .route("/jobs/{job_id}/cancel", post(jobs::cancel_job))
        .route("/jobs/{job_id}/retry", post(jobs::retry_job))
        .route("/jobs/{job_id}/events", get(events::job_events))
        .route("/ws/jobs/{job_id}", get(events::job_ws))
        .route("/search", get(retrieval::search))
        .route("/chat", post(retrieval::chat))
        .with_state(ctx.clone());

    if !ctx.settings.cors_origins.is_empty() {
        let origins: Vec<HeaderValue> = ctx
            .settings
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        app = app.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    app
}

/// Open the store, run recovery, start the worker (unless disabled), and
/// serve until shutdown.
pub async fn serve(ctx: Arc<AppContext>) -> Result<()> {
    ctx.store.recover_incomplete_state()?;
    ctx.refresh_runtime_preferences()?;

    let worker_stop = if ctx.settings.disable_worker {
        info!("Job worker disabled by EDGE_VIDEO_AGENT_DISABLE_WORKER");
        None
    } else {
        let worker = JobWorker::new(ctx.clone());
        let stop = worker.stop_handle();
        tokio::spawn(worker.run_forever());
        Some(stop)
    };

    let addr = format!("{}:{}", ctx.settings.host, ctx.settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{addr}");

    axum::serve(listener, router(ctx)).await?;

    if let Some(stop) = worker_stop {
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
    }
    Ok(())
}
