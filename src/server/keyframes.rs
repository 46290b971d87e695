//! Keyframe endpoints: extraction gating on normalized params, listing,
//! nearest lookup, image serving, and outline alignment.

use super::{accepted, require_video, ApiError, ApiResult};
use crate::app::AppContext;
use crate::store::Keyframe;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn image_url(video_id: &str, keyframe_id: &str) -> String {
    format!("/videos/{video_id}/keyframes/{keyframe_id}/image")
}

/// Project request params down to the fields that matter for the mode; the
/// freshness criterion for keyframes is deep equality on this projection.
pub(super) fn normalize_keyframes_params(obj: &Value) -> Value {
    let mode = obj
        .get("mode")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("interval");

    let mut out = Map::new();
    out.insert("mode".into(), json!(mode));

    if mode == "scene" {
        if let Some(v) = obj.get("scene_threshold").and_then(Value::as_f64) {
            out.insert("scene_threshold".into(), json!(v));
        }
        if let Some(v) = obj.get("min_gap_seconds").and_then(Value::as_f64) {
            out.insert("min_gap_seconds".into(), json!(v));
        }
    } else if let Some(v) = obj.get("interval_seconds").and_then(Value::as_f64) {
        out.insert("interval_seconds".into(), json!(v));
    }

    if let Some(v) = obj.get("max_frames").and_then(Value::as_i64) {
        out.insert("max_frames".into(), json!(v));
    }
    if let Some(v) = obj.get("target_width").and_then(Value::as_i64) {
        out.insert("target_width".into(), json!(v));
    }
    Value::Object(out)
}

#[derive(Deserialize)]
pub(super) struct CreateKeyframesJobRequest {
    #[serde(default)]
    from_scratch: bool,
    #[serde(default = "default_mode")]
    mode: String,
    interval_seconds: Option<f64>,
    scene_threshold: Option<f64>,
    min_gap_seconds: Option<f64>,
    max_frames: Option<i64>,
    target_width: Option<i64>,
}

fn default_mode() -> String {
    "interval".to_string()
}

pub(super) async fn create_keyframes_job(
    State(ctx): State<Arc<AppContext>>,
    Path(video_id): Path<String>,
    Json(req): Json<CreateKeyframesJobRequest>,
) -> ApiResult<Response> {
    require_video(&ctx, &video_id)?;

    if let Some(existing) = ctx.store.get_active_job_for_video(&video_id, "keyframes")? {
        return Ok(accepted("KEYFRAMES_IN_PROGRESS", &existing.id, &video_id));
    }

    if req.from_scratch {
        ctx.store.delete_video_keyframes_for_video(&video_id)?;
        ctx.store.delete_video_keyframe_index(&video_id)?;
        ctx.remove_keyframe_jpgs(&video_id);
    }

    let mode = if req.mode.trim().is_empty() {
        "interval".to_string()
    } else {
        req.mode.trim().to_string()
    };

    let mut params = Map::new();
    params.insert("mode".into(), json!(mode));
    if let Some(v) = req.interval_seconds {
        params.insert("interval_seconds".into(), json!(v));
    }
    if let Some(v) = req.scene_threshold {
        params.insert("scene_threshold".into(), json!(v));
    }
    if let Some(v) = req.min_gap_seconds {
        params.insert("min_gap_seconds".into(), json!(v));
    }
    if let Some(v) = req.max_frames {
        params.insert("max_frames".into(), json!(v));
    }
    if let Some(v) = req.target_width {
        params.insert("target_width".into(), json!(v));
    }
    if req.from_scratch {
        params.insert("from_scratch".into(), json!(true));
    }
    let params = Value::Object(params);

    if !req.from_scratch {
        if let Some(index) = ctx.store.get_video_keyframe_index(&video_id)? {
            if index.status == "completed" {
                let stored = index.params.clone().unwrap_or_else(|| json!({}));
                if normalize_keyframes_params(&stored) == normalize_keyframes_params(&params) {
                    return Ok((
                        StatusCode::OK,
                        Json(json!({
                            "detail": "KEYFRAMES_ALREADY_COMPLETED",
                            "video_id": video_id,
                            "index": index,
                        })),
                    )
                        .into_response());
                }
            }
        }
    }

    let job = ctx.store.create_job(&video_id, "keyframes", &params)?;
    Ok(accepted("KEYFRAMES_STARTED", &job.id, &video_id))
}

pub(super) async fn get_keyframes_index(
    State(ctx): State<Arc<AppContext>>,
    Path(video_id): Path<String>,
) -> ApiResult<Response> {
    require_video(&ctx, &video_id)?;
    match ctx.store.get_video_keyframe_index(&video_id)? {
        Some(index) => Ok(Json(index).into_response()),
        None => Ok(Json(json!({
            "video_id": video_id,
            "status": "not_indexed",
            "progress": 0.0,
            "message": "",
        }))
        .into_response()),
    }
}

#[derive(Deserialize)]
pub(super) struct ListKeyframesQuery {
    method: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

fn keyframe_json(video_id: &str, keyframe: &Keyframe) -> Value {
    let mut out = serde_json::to_value(keyframe).unwrap_or_else(|_| json!({}));
    out["image_url"] = json!(image_url(video_id, &keyframe.id));
    out
}

pub(super) async fn list_keyframes(
    State(ctx): State<Arc<AppContext>>,
    Path(video_id): Path<String>,
    Query(query): Query<ListKeyframesQuery>,
) -> ApiResult<Response> {
    require_video(&ctx, &video_id)?;

    let method = query
        .method
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let page = ctx
        .store
        .list_video_keyframes(&video_id, method, query.limit, query.offset)?;

    let items: Vec<Value> = page
        .items
        .iter()
        .map(|k| keyframe_json(&video_id, k))
        .collect();
    Ok(Json(json!({ "total": page.total, "items": items })).into_response())
}

#[derive(Deserialize)]
pub(super) struct NearestKeyframeQuery {
    timestamp_ms: i64,
    #[serde(default = "default_method")]
    method: String,
}

fn default_method() -> String {
    "interval".to_string()
}

pub(super) async fn nearest_keyframe(
    State(ctx): State<Arc<AppContext>>,
    Path(video_id): Path<String>,
    Query(query): Query<NearestKeyframeQuery>,
) -> ApiResult<Response> {
    require_video(&ctx, &video_id)?;

    let method = if query.method.trim().is_empty() {
        "interval"
    } else {
        query.method.trim()
    };
    let keyframe = ctx
        .store
        .get_nearest_video_keyframe(&video_id, query.timestamp_ms, Some(method))?
        .ok_or_else(|| ApiError::not_found("KEYFRAME_NOT_FOUND"))?;

    Ok(Json(keyframe_json(&video_id, &keyframe)).into_response())
}

pub(super) async fn get_keyframe_image(
    State(ctx): State<Arc<AppContext>>,
    Path((video_id, keyframe_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    require_video(&ctx, &video_id)?;

    let keyframe = ctx
        .store
        .get_video_keyframe(&keyframe_id)?
        .ok_or_else(|| ApiError::not_found("KEYFRAME_NOT_FOUND"))?;
    if keyframe.video_id != video_id {
        return Err(ApiError::not_found("KEYFRAME_NOT_FOUND"));
    }
    if keyframe.image_relpath.is_empty() {
        return Err(ApiError::not_found("KEYFRAME_IMAGE_NOT_FOUND"));
    }

    let abspath = ctx.settings.data_dir.join(&keyframe.image_relpath);
    let bytes = std::fs::read(&abspath)
        .map_err(|_| ApiError::not_found("KEYFRAME_IMAGE_NOT_FOUND"))?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response())
}

#[derive(Deserialize)]
pub(super) struct AlignedKeyframesQuery {
    #[serde(default = "default_method")]
    method: String,
    #[serde(default = "default_per_section")]
    per_section: i64,
    #[serde(default = "default_min_gap")]
    min_gap_seconds: f64,
    #[serde(default = "default_fallback")]
    fallback: String,
}

fn default_per_section() -> i64 {
    2
}

fn default_min_gap() -> f64 {
    2.0
}

fn default_fallback() -> String {
    "none".to_string()
}

/// For each outline section, pick up to `per_section` frames in its time
/// range: scene frames ranked by score with a minimum gap, interval frames
/// evenly spaced. `fallback=nearest` tops scene sections up from the frames
/// closest to the section midpoint.
pub(super) async fn aligned_keyframes(
    State(ctx): State<Arc<AppContext>>,
    Path(video_id): Path<String>,
    Query(query): Query<AlignedKeyframesQuery>,
) -> ApiResult<Response> {
    require_video(&ctx, &video_id)?;

    let per_section = query.per_section.clamp(1, 10) as usize;
    let method = if query.method.trim().is_empty() {
        "interval"
    } else {
        query.method.trim()
    };
    if method != "interval" && method != "scene" {
        return Err(ApiError::bad_request("UNSUPPORTED_KEYFRAMES_METHOD"));
    }
    let fallback = if query.fallback.trim().is_empty() {
        "none"
    } else {
        query.fallback.trim()
    };
    if fallback != "none" && fallback != "nearest" {
        return Err(ApiError::bad_request("UNSUPPORTED_FALLBACK"));
    }
    let min_gap_ms = (query.min_gap_seconds.max(0.0) * 1000.0).round() as i64;

    let summary = ctx
        .store
        .get_video_summary(&video_id)?
        .ok_or_else(|| ApiError::not_found("SUMMARY_NOT_FOUND"))?;
    let outline: Value = summary
        .outline_json
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_else(|| json!([]));

    let frames = ctx
        .store
        .list_video_keyframes(&video_id, Some(method), 500, 0)?
        .items;

    let all_frames: Vec<Keyframe> = if method == "scene" && fallback == "nearest" {
        ctx.store
            .list_video_keyframes(&video_id, None, 2000, 0)?
            .items
    } else {
        Vec::new()
    };

    let mut out_items: Vec<Value> = Vec::new();
    for section in outline.as_array().map(Vec::as_slice).unwrap_or(&[]) {
        let start = section.get("start_time").and_then(Value::as_f64).unwrap_or(0.0);
        let end = section.get("end_time").and_then(Value::as_f64).unwrap_or(0.0);
        let mut start_ms = (start * 1000.0).round() as i64;
        let mut end_ms = (end * 1000.0).round() as i64;
        if end_ms < start_ms {
            std::mem::swap(&mut start_ms, &mut end_ms);
        }

        let in_range: Vec<&Keyframe> = frames
            .iter()
            .filter(|f| start_ms <= f.timestamp_ms && f.timestamp_ms <= end_ms)
            .collect();

        let mut picked: Vec<&Keyframe> = Vec::new();
        if !in_range.is_empty() {
            if method == "scene" {
                let mut ranked = in_range.clone();
                ranked.sort_by(|a, b| {
                    b.score
                        .unwrap_or(0.0)
                        .partial_cmp(&a.score.unwrap_or(0.0))
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                for frame in ranked {
                    if picked.len() >= per_section {
                        break;
                    }
                    if min_gap_ms > 0
                        && picked
                            .iter()
                            .any(|p| (frame.timestamp_ms - p.timestamp_ms).abs() < min_gap_ms)
                    {
                        continue;
                    }
                    picked.push(frame);
                }
                picked.sort_by_key(|f| f.timestamp_ms);
            } else if in_range.len() <= per_section {
                picked = in_range;
            } else {
                for j in 0..per_section {
                    let idx = ((j as f64) * ((in_range.len() - 1) as f64)
                        / ((per_section - 1).max(1) as f64))
                        .round() as usize;
                    picked.push(in_range[idx]);
                }
            }
        }

        if method == "scene"
            && fallback == "nearest"
            && picked.len() < per_section
            && !all_frames.is_empty()
        {
            let mid_ms = (start_ms + end_ms) / 2;
            let mut pool: Vec<&Keyframe> = all_frames.iter().collect();
            pool.sort_by_key(|f| (f.timestamp_ms - mid_ms).abs());

            for frame in pool {
                if picked.len() >= per_section {
                    break;
                }
                if picked.iter().any(|p| p.id == frame.id) {
                    continue;
                }
                if min_gap_ms > 0
                    && picked
                        .iter()
                        .any(|p| (frame.timestamp_ms - p.timestamp_ms).abs() < min_gap_ms)
                {
                    continue;
                }
                picked.push(frame);
            }
            picked.sort_by_key(|f| f.timestamp_ms);
        }

        let keyframes: Vec<Value> = picked
            .iter()
            .map(|f| {
                json!({
                    "id": f.id,
                    "timestamp_ms": f.timestamp_ms,
                    "image_url": image_url(&video_id, &f.id),
                    "score": f.score,
                })
            })
            .collect();

        out_items.push(json!({
            "title": section.get("title").cloned().unwrap_or(Value::Null),
            "start_time": start,
            "end_time": end,
            "keyframes": keyframes,
        }));
    }

    Ok(Json(json!({ "video_id": video_id, "items": out_items })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_projects_by_mode() {
        let interval = json!({
            "mode": "interval",
            "interval_seconds": 10.0,
            "scene_threshold": 0.4,
            "max_frames": 100,
        });
        let normalized = normalize_keyframes_params(&interval);
        assert_eq!(normalized["interval_seconds"], 10.0);
        assert!(normalized.get("scene_threshold").is_none());

        let scene = json!({
            "mode": "scene",
            "interval_seconds": 10.0,
            "scene_threshold": 0.4,
            "min_gap_seconds": 2.0,
        });
        let normalized = normalize_keyframes_params(&scene);
        assert_eq!(normalized["scene_threshold"], 0.4);
        assert!(normalized.get("interval_seconds").is_none());
    }

    #[test]
    fn test_normalize_ignores_irrelevant_fields() {
        let a = json!({"mode": "interval", "from_scratch": true});
        let b = json!({"mode": "interval"});
        assert_eq!(normalize_keyframes_params(&a), normalize_keyframes_params(&b));

        let c = json!({"mode": "scene", "scene_threshold": 0.3});
        assert_ne!(normalize_keyframes_params(&b), normalize_keyframes_params(&c));
    }
}
