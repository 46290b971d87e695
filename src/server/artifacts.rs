//! Index and summary endpoints: idempotency gating plus artifact reads with
//! derived staleness.

use super::{accepted, require_video, ApiError, ApiResult};
use crate::app::AppContext;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

fn require_transcript(ctx: &AppContext, video_id: &str) -> ApiResult<()> {
    if !ctx.transcripts.exists(video_id) {
        return Err(ApiError::not_found("TRANSCRIPT_NOT_FOUND"));
    }
    if ctx.transcripts.load(video_id, Some(1))?.is_empty() {
        return Err(ApiError::not_found("TRANSCRIPT_NOT_FOUND"));
    }
    Ok(())
}

#[derive(Deserialize)]
pub(super) struct CreateIndexJobRequest {
    #[serde(default = "default_true")]
    from_scratch: bool,
    embed_model: Option<String>,
    embed_dim: Option<i64>,
    target_window_seconds: Option<f64>,
    max_window_seconds: Option<f64>,
    min_window_seconds: Option<f64>,
    overlap_seconds: Option<f64>,
}

fn default_true() -> bool {
    true
}

pub(super) async fn create_index_job(
    State(ctx): State<Arc<AppContext>>,
    Path(video_id): Path<String>,
    Json(req): Json<CreateIndexJobRequest>,
) -> ApiResult<Response> {
    require_video(&ctx, &video_id)?;
    require_transcript(&ctx, &video_id)?;

    if let Some(existing) = ctx.store.get_active_job_for_video(&video_id, "index")? {
        return Ok(accepted("INDEXING_IN_PROGRESS", &existing.id, &video_id));
    }

    let index = ctx.store.get_video_index(&video_id)?;
    let current_hash = ctx.transcripts.content_hash(&video_id)?;

    let mut from_scratch = req.from_scratch;
    if let Some(index) = &index {
        if index.status == "completed" {
            let index_hash = index.transcript_hash.as_deref().unwrap_or("");
            let fresh =
                !index_hash.is_empty() && !current_hash.is_empty() && index_hash == current_hash;
            if fresh && !req.from_scratch {
                return Ok((
                    StatusCode::OK,
                    Json(json!({
                        "detail": "INDEX_ALREADY_COMPLETED",
                        "video_id": video_id,
                        "index": index,
                    })),
                )
                    .into_response());
            }
            // Stale completed index: force a rebuild.
            if !current_hash.is_empty() && index_hash != current_hash {
                from_scratch = true;
            }
        }
    }

    let mut params = serde_json::Map::new();
    params.insert("from_scratch".into(), json!(from_scratch));
    if let Some(v) = &req.embed_model {
        params.insert("embed_model".into(), json!(v));
    }
    if let Some(v) = req.embed_dim {
        params.insert("embed_dim".into(), json!(v));
    }
    if let Some(v) = req.target_window_seconds {
        params.insert("target_window_seconds".into(), json!(v));
    }
    if let Some(v) = req.max_window_seconds {
        params.insert("max_window_seconds".into(), json!(v));
    }
    if let Some(v) = req.min_window_seconds {
        params.insert("min_window_seconds".into(), json!(v));
    }
    if let Some(v) = req.overlap_seconds {
        params.insert("overlap_seconds".into(), json!(v));
    }

    let job = ctx
        .store
        .create_job(&video_id, "index", &Value::Object(params))?;
    Ok(accepted("INDEXING_STARTED", &job.id, &video_id))
}

pub(super) async fn get_index_status(
    State(ctx): State<Arc<AppContext>>,
    Path(video_id): Path<String>,
) -> ApiResult<Response> {
    require_video(&ctx, &video_id)?;

    let current_hash = ctx.transcripts.content_hash(&video_id)?;
    let Some(index) = ctx.store.get_video_index(&video_id)? else {
        return Ok(Json(json!({
            "video_id": video_id,
            "status": "not_indexed",
            "current_transcript_hash": current_hash,
            "is_stale": false,
        }))
        .into_response());
    };

    let mut out = serde_json::to_value(&index)?;
    out["current_transcript_hash"] = json!(current_hash);
    let is_stale = index.status == "completed"
        && !current_hash.is_empty()
        && index.transcript_hash.as_deref().unwrap_or("") != current_hash;
    out["is_stale"] = json!(is_stale);
    Ok(Json(out).into_response())
}

#[derive(Deserialize)]
pub(super) struct CreateSummarizeJobRequest {
    #[serde(default)]
    from_scratch: bool,
    target_window_seconds: Option<f64>,
    max_window_seconds: Option<f64>,
    min_window_seconds: Option<f64>,
    overlap_seconds: Option<f64>,
}

pub(super) async fn create_summarize_job(
    State(ctx): State<Arc<AppContext>>,
    Path(video_id): Path<String>,
    Json(req): Json<CreateSummarizeJobRequest>,
) -> ApiResult<Response> {
    require_video(&ctx, &video_id)?;
    require_transcript(&ctx, &video_id)?;

    if let Some(existing) = ctx.store.get_active_job_for_video(&video_id, "summarize")? {
        return Ok(accepted("SUMMARIZING_IN_PROGRESS", &existing.id, &video_id));
    }

    let summary = ctx.store.get_video_summary(&video_id)?;
    let current_hash = ctx.transcripts.content_hash(&video_id)?;

    let mut from_scratch = req.from_scratch;
    if let Some(summary) = &summary {
        if summary.status == "completed" {
            let summary_hash = summary.transcript_hash.as_deref().unwrap_or("");
            let fresh = !summary_hash.is_empty()
                && !current_hash.is_empty()
                && summary_hash == current_hash;
            if fresh && !req.from_scratch {
                return Ok((
                    StatusCode::OK,
                    Json(json!({
                        "detail": "SUMMARY_ALREADY_COMPLETED",
                        "video_id": video_id,
                        "summary": summary,
                    })),
                )
                    .into_response());
            }
            if !current_hash.is_empty() && summary_hash != current_hash {
                from_scratch = true;
            }
        }
    }

    let mut params = serde_json::Map::new();
    params.insert("from_scratch".into(), json!(from_scratch));
    if let Some(v) = req.target_window_seconds {
        params.insert("target_window_seconds".into(), json!(v));
    }
    if let Some(v) = req.max_window_seconds {
        params.insert("max_window_seconds".into(), json!(v));
    }
    if let Some(v) = req.min_window_seconds {
        params.insert("min_window_seconds".into(), json!(v));
    }
    if let Some(v) = req.overlap_seconds {
        params.insert("overlap_seconds".into(), json!(v));
    }

    let job = ctx
        .store
        .create_job(&video_id, "summarize", &Value::Object(params))?;
    Ok(accepted("SUMMARIZE_STARTED", &job.id, &video_id))
}

pub(super) async fn get_summary(
    State(ctx): State<Arc<AppContext>>,
    Path(video_id): Path<String>,
) -> ApiResult<Response> {
    require_video(&ctx, &video_id)?;

    let current_hash = ctx.transcripts.content_hash(&video_id)?;
    let Some(summary) = ctx.store.get_video_summary(&video_id)? else {
        return Ok(Json(json!({
            "video_id": video_id,
            "status": "not_summarized",
            "current_transcript_hash": current_hash,
            "is_stale": false,
        }))
        .into_response());
    };

    let mut out = serde_json::to_value(&summary)?;
    out["current_transcript_hash"] = json!(current_hash);
    let is_stale = summary.status == "completed"
        && !current_hash.is_empty()
        && summary.transcript_hash.as_deref().unwrap_or("") != current_hash;
    out["is_stale"] = json!(is_stale);
    if out["segment_summaries"].is_null() {
        out["segment_summaries"] = json!([]);
    }
    Ok(Json(out).into_response())
}

pub(super) async fn get_outline(
    State(ctx): State<Arc<AppContext>>,
    Path(video_id): Path<String>,
) -> ApiResult<Response> {
    require_video(&ctx, &video_id)?;
    let summary = ctx
        .store
        .get_video_summary(&video_id)?
        .ok_or_else(|| ApiError::not_found("SUMMARY_NOT_FOUND"))?;

    let outline_raw = summary.outline_json.clone().unwrap_or_else(|| "[]".into());
    let outline = serde_json::from_str::<Value>(&outline_raw)
        .unwrap_or_else(|_| json!({ "raw": outline_raw }));

    Ok(Json(json!({
        "video_id": video_id,
        "status": summary.status,
        "progress": summary.progress,
        "message": summary.message,
        "outline": outline,
    }))
    .into_response())
}

pub(super) async fn export_summary_markdown(
    State(ctx): State<Arc<AppContext>>,
    Path(video_id): Path<String>,
) -> ApiResult<Response> {
    require_video(&ctx, &video_id)?;
    let summary = ctx
        .store
        .get_video_summary(&video_id)?
        .ok_or_else(|| ApiError::not_found("SUMMARY_NOT_FOUND"))?;

    if summary.status != "completed" {
        return Err(ApiError::bad_request("SUMMARY_NOT_COMPLETED"));
    }
    let body = summary.summary_markdown.unwrap_or_default();
    if body.trim().is_empty() {
        return Err(ApiError::not_found("SUMMARY_EMPTY"));
    }

    Ok((
        [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
        body,
    )
        .into_response())
}

#[derive(Deserialize)]
pub(super) struct ListChunksQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub(super) async fn list_chunks(
    State(ctx): State<Arc<AppContext>>,
    Path(video_id): Path<String>,
    Query(query): Query<ListChunksQuery>,
) -> ApiResult<Response> {
    require_video(&ctx, &video_id)?;
    let page = ctx.store.list_chunks(&video_id, query.limit, query.offset)?;
    Ok(Json(page).into_response())
}
