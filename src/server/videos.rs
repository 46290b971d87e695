//! Video import, listing, file serving, transcript and subtitle export.

use super::{require_video, ApiError, ApiResult};
use crate::app::AppContext;
use crate::hashing::sha256_file;
use crate::media;
use crate::subtitle::{segments_to_srt, segments_to_vtt};
use axum::extract::{Path, Query, Request, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::info;

#[derive(Deserialize)]
pub(super) struct ImportVideoRequest {
    file_path: String,
}

pub(super) async fn import_video(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<ImportVideoRequest>,
) -> ApiResult<Response> {
    let path = std::path::PathBuf::from(&req.file_path);
    if req.file_path.is_empty() || !path.exists() {
        return Err(ApiError::bad_request("FILE_NOT_FOUND"));
    }

    let duration = media::duration_seconds(&path)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let file_hash = sha256_file(&path)?;
    let file_size = std::fs::metadata(&path).map(|m| m.len() as i64).unwrap_or(0);

    let video = ctx
        .store
        .create_or_get_video(&req.file_path, &file_hash, duration, file_size)?;
    info!("Imported video {} ({})", video.id, video.title);
    Ok(Json(video).into_response())
}

pub(super) async fn get_video(
    State(ctx): State<Arc<AppContext>>,
    Path(video_id): Path<String>,
) -> ApiResult<Response> {
    let video = require_video(&ctx, &video_id)?;
    Ok(Json(video).into_response())
}

#[derive(Deserialize)]
pub(super) struct ListVideosQuery {
    status: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub(super) async fn list_videos(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<ListVideosQuery>,
) -> ApiResult<Response> {
    let page = ctx.store.list_videos(
        query.status.as_deref().filter(|s| !s.is_empty()),
        query.limit.clamp(1, 200),
        query.offset.max(0),
    )?;
    Ok(Json(page).into_response())
}

/// Serve the raw media file with range support.
pub(super) async fn get_video_file(
    State(ctx): State<Arc<AppContext>>,
    Path(video_id): Path<String>,
    request: Request,
) -> ApiResult<Response> {
    let video = require_video(&ctx, &video_id)?;
    if video.file_path.is_empty() {
        return Err(ApiError::not_found("VIDEO_FILE_NOT_FOUND"));
    }
    let path = std::path::PathBuf::from(&video.file_path);
    if !path.exists() {
        return Err(ApiError::not_found("VIDEO_FILE_NOT_FOUND"));
    }

    let mut response = ServeFile::new(&path)
        .oneshot(request)
        .await
        .map_err(|e| ApiError::new(axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .into_response();
    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, header::HeaderValue::from_static("bytes"));
    Ok(response)
}

#[derive(Deserialize)]
pub(super) struct TranscriptQuery {
    limit: Option<usize>,
}

pub(super) async fn get_transcript(
    State(ctx): State<Arc<AppContext>>,
    Path(video_id): Path<String>,
    Query(query): Query<TranscriptQuery>,
) -> ApiResult<Response> {
    let segments = ctx.transcripts.load(&video_id, query.limit)?;
    Ok(Json(serde_json::json!({
        "video_id": video_id,
        "segments": segments,
    }))
    .into_response())
}

pub(super) async fn export_subtitles(
    State(ctx): State<Arc<AppContext>>,
    Path((video_id, fmt)): Path<(String, String)>,
) -> ApiResult<Response> {
    let fmt = fmt.trim().to_lowercase();
    if !ctx.transcripts.exists(&video_id) {
        return Err(ApiError::not_found("TRANSCRIPT_NOT_FOUND"));
    }
    let segments = ctx.transcripts.load(&video_id, None)?;
    if segments.is_empty() {
        return Err(ApiError::not_found("TRANSCRIPT_NOT_FOUND"));
    }

    match fmt.as_str() {
        "srt" => Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            segments_to_srt(&segments),
        )
            .into_response()),
        "vtt" => Ok((
            [(header::CONTENT_TYPE, "text/vtt; charset=utf-8")],
            segments_to_vtt(&segments),
        )
            .into_response()),
        _ => Err(ApiError::bad_request("UNSUPPORTED_SUBTITLE_FORMAT")),
    }
}
