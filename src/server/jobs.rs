//! Job endpoints: enqueue transcription, inspect, cancel, retry.

use super::{require_video, ApiError, ApiResult};
use crate::app::AppContext;
use crate::vector_store::{chunks_collection_name, LEGACY_COLLECTION_NAME};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

#[derive(Deserialize)]
pub(super) struct CreateTranscribeJobRequest {
    video_id: String,
    segment_seconds: Option<i64>,
    overlap_seconds: Option<i64>,
    #[serde(default)]
    from_scratch: bool,
}

pub(super) async fn create_transcribe_job(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<CreateTranscribeJobRequest>,
) -> ApiResult<Response> {
    require_video(&ctx, &req.video_id)?;

    let mut params = serde_json::Map::new();
    if let Some(segment_seconds) = req.segment_seconds {
        params.insert("segment_seconds".into(), json!(segment_seconds));
    }
    if let Some(overlap_seconds) = req.overlap_seconds {
        params.insert("overlap_seconds".into(), json!(overlap_seconds));
    }
    if req.from_scratch {
        params.insert("from_scratch".into(), json!(true));
    }

    let job = ctx
        .store
        .create_job(&req.video_id, "transcribe", &Value::Object(params))?;
    Ok(Json(job).into_response())
}

pub(super) async fn get_job(
    State(ctx): State<Arc<AppContext>>,
    Path(job_id): Path<String>,
) -> ApiResult<Response> {
    let job = ctx
        .store
        .get_job(&job_id)?
        .ok_or_else(|| ApiError::not_found("JOB_NOT_FOUND"))?;
    Ok(Json(job).into_response())
}

#[derive(Deserialize)]
pub(super) struct ListJobsQuery {
    status: Option<String>,
    video_id: Option<String>,
    job_type: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub(super) async fn list_jobs(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Response> {
    let page = ctx.store.list_jobs(
        query.status.as_deref().filter(|s| !s.is_empty()),
        query.video_id.as_deref().filter(|s| !s.is_empty()),
        query.job_type.as_deref().filter(|s| !s.is_empty()),
        query.limit.clamp(1, 200),
        query.offset.max(0),
    )?;
    Ok(Json(page).into_response())
}

pub(super) async fn cancel_job(
    State(ctx): State<Arc<AppContext>>,
    Path(job_id): Path<String>,
) -> ApiResult<Response> {
    let job = ctx
        .store
        .get_job(&job_id)?
        .ok_or_else(|| ApiError::not_found("JOB_NOT_FOUND"))?;

    if !ctx.store.cancel_job(&job_id)? {
        return Err(ApiError::bad_request("JOB_NOT_CANCELLABLE"));
    }

    if job.job_type == "transcribe" {
        ctx.store.set_video_status(&job.video_id, "pending")?;
    }

    let job = ctx.store.get_job(&job_id)?;
    Ok(Json(job).into_response())
}

#[derive(Deserialize, Default)]
pub(super) struct RetryJobRequest {
    #[serde(default)]
    from_scratch: bool,
}

/// Reset a terminal job back to pending. With `from_scratch`, external
/// artifacts are cleaned up first; if the reset then fails the cleanup has
/// already happened (destructive-on-retry).
pub(super) async fn retry_job(
    State(ctx): State<Arc<AppContext>>,
    Path(job_id): Path<String>,
    Json(req): Json<RetryJobRequest>,
) -> ApiResult<Response> {
    let job = ctx
        .store
        .get_job(&job_id)?
        .ok_or_else(|| ApiError::not_found("JOB_NOT_FOUND"))?;

    if matches!(job.status.as_str(), "pending" | "running") {
        return Err(ApiError::bad_request("JOB_NOT_RETRIABLE"));
    }

    if req.from_scratch {
        match job.job_type.as_str() {
            "transcribe" => ctx.transcripts.delete(&job.video_id)?,
            "index" => {
                ctx.store.delete_chunks_for_video(&job.video_id)?;
                ctx.store.delete_video_index(&job.video_id)?;

                let embed_model = job
                    .params
                    .get("embed_model")
                    .and_then(Value::as_str)
                    .unwrap_or(&ctx.settings.embedding_model);
                let embed_dim = job
                    .params
                    .get("embed_dim")
                    .and_then(Value::as_i64)
                    .unwrap_or(ctx.settings.embedding_dim);
                let versioned = chunks_collection_name(embed_model, embed_dim);
                for collection in [versioned.as_str(), LEGACY_COLLECTION_NAME] {
                    if let Err(e) = ctx.vectors.delete_video_vectors(collection, &job.video_id) {
                        warn!("Ignoring vector delete failure on {collection}: {e}");
                    }
                }
            }
            "summarize" => ctx.store.delete_video_summary(&job.video_id)?,
            "keyframes" => {
                ctx.store.delete_video_keyframes_for_video(&job.video_id)?;
                ctx.store.delete_video_keyframe_index(&job.video_id)?;
                ctx.remove_keyframe_jpgs(&job.video_id);
            }
            _ => {}
        }
    }

    if !ctx.store.reset_job(&job_id)? {
        return Err(ApiError::bad_request("JOB_RESET_FAILED"));
    }

    if job.job_type == "transcribe" {
        ctx.store.set_video_status(&job.video_id, "pending")?;
    }

    let job = ctx.store.get_job(&job_id)?;
    Ok(Json(job).into_response())
}
