//! Keyframes pipeline: pick candidate timestamps (fixed interval or ranked
//! scene changes), extract one JPEG per pick, probe its dimensions, and
//! record rows in ascending time order.

use super::{ensure_same_run, param_bool, param_f64, param_i64, param_str, worker_stopped};
use crate::app::AppContext;
use crate::error::{Result, SiktError};
use crate::media;
use crate::store::{Job, JobUpdate, KeyframeIndexState};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Greedy scene-frame selection: take candidates in descending score order,
/// skip anything out of range or within `min_gap_s` of a kept pick, stop at
/// `max_frames`, and return the keepers sorted by time.
fn pick_scene_frames(
    mut candidates: Vec<(f64, f64)>,
    duration: f64,
    max_frames: usize,
    min_gap_s: f64,
) -> Vec<(f64, f64)> {
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut picked: Vec<(f64, f64)> = Vec::new();
    for (ts, score) in candidates {
        if picked.len() >= max_frames {
            break;
        }
        if ts < 0.0 || ts > duration {
            continue;
        }
        if min_gap_s > 0.0 && picked.iter().any(|(p, _)| (ts - p).abs() < min_gap_s) {
            continue;
        }
        picked.push((ts, score));
    }
    picked.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    picked
}

#[instrument(skip_all, fields(job_id = %job.id, video_id = %job.video_id))]
pub(super) async fn run(
    ctx: &AppContext,
    stop: &AtomicBool,
    job: &Job,
    claimed_started_at: &str,
) -> Result<()> {
    let video_id = job.video_id.clone();
    let video = ctx
        .store
        .get_video(&video_id)?
        .ok_or_else(|| SiktError::pipeline("E_INTERNAL", format!("video not found: {video_id}")))?;

    let media_path = std::path::PathBuf::from(&video.file_path);
    let duration = video.duration;

    let mode = param_str(&job.params, "mode")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("interval")
        .to_string();
    if mode != "interval" && mode != "scene" {
        return Err(SiktError::pipeline("E_JOB_FAILED", "UNSUPPORTED_KEYFRAMES_MODE"));
    }

    let mut interval_s = param_f64(&job.params, "interval_seconds").unwrap_or(10.0);
    if interval_s <= 0.0 {
        interval_s = 10.0;
    }

    let mut scene_threshold = param_f64(&job.params, "scene_threshold").unwrap_or(0.3);
    if scene_threshold <= 0.0 {
        scene_threshold = 0.3;
    }
    if scene_threshold > 1.0 {
        scene_threshold = 1.0;
    }

    let min_gap_s = param_f64(&job.params, "min_gap_seconds")
        .unwrap_or(2.0)
        .max(0.0);
    let max_frames = param_i64(&job.params, "max_frames")
        .unwrap_or(200)
        .clamp(1, 500) as usize;
    let target_width = param_i64(&job.params, "target_width").filter(|w| *w > 0);

    if param_bool(&job.params, "from_scratch") {
        ctx.store.delete_video_keyframes_for_video(&video_id)?;
        ctx.store.delete_video_keyframe_index(&video_id)?;
        ctx.remove_keyframe_jpgs(&video_id);
    }

    let params_json = serde_json::to_string(&job.params)?;
    ctx.store.upsert_video_keyframe_index(
        &video_id,
        &KeyframeIndexState {
            status: "running".into(),
            progress: 0.0,
            message: "starting".into(),
            params_json: Some(params_json.clone()),
            frame_count: 0,
            ..Default::default()
        },
    )?;
    ctx.store
        .update_job(&job.id, &JobUpdate::progress(0.0, "starting"))?;

    if duration <= 0.0 {
        return Err(SiktError::pipeline(
            "E_VIDEO_DURATION_INVALID",
            format!("duration={duration}"),
        ));
    }

    // Candidate timestamps with optional scene scores.
    let mut times: Vec<(f64, Option<f64>)> = Vec::new();
    if mode == "interval" {
        let mut t = 0.0;
        while t < duration && times.len() < max_frames {
            times.push((t, None));
            t += interval_s;
        }
    } else {
        let candidates = media::detect_scene_changes(&media_path, scene_threshold).await?;
        times = pick_scene_frames(candidates, duration, max_frames, min_gap_s)
            .into_iter()
            .map(|(ts, sc)| (ts, Some(sc)))
            .collect();
    }

    if times.is_empty() {
        times.push((0.0, None));
    }

    let total = times.len();
    for (i, (ts, score)) in times.iter().enumerate() {
        let i = i + 1;
        if stop.load(Ordering::Relaxed) {
            return Err(worker_stopped());
        }
        ensure_same_run(ctx, &job.id, claimed_started_at)?;

        let progress = (((i - 1) as f64) / (total.max(1) as f64)).min(0.99);
        let message = match score {
            Some(score) if mode == "scene" => format!("frame {i}/{total} score={score:.3}"),
            _ => format!("frame {i}/{total}"),
        };
        ctx.store
            .update_job(&job.id, &JobUpdate::progress(progress, message.clone()))?;
        ctx.store.upsert_video_keyframe_index(
            &video_id,
            &KeyframeIndexState {
                status: "running".into(),
                progress,
                message,
                params_json: Some(params_json.clone()),
                frame_count: (i - 1) as i64,
                ..Default::default()
            },
        )?;

        let keyframe_id = Uuid::new_v4().to_string();
        let jpg_relpath = ctx.settings.keyframe_relpath(&video_id, &keyframe_id);
        let jpg_abspath = ctx.settings.keyframe_abspath(&video_id, &keyframe_id);
        media::extract_frame_jpg(&media_path, &jpg_abspath, *ts, target_width).await?;

        let (width, height) = match media::jpg_dimensions(&jpg_abspath) {
            Ok((w, h)) => (Some(w as i64), Some(h as i64)),
            Err(e) => {
                debug!("Dimension probe failed for {jpg_relpath}: {e}");
                (None, None)
            }
        };

        ctx.store.insert_video_keyframe(
            &keyframe_id,
            &video_id,
            (ts * 1000.0).round() as i64,
            &jpg_relpath,
            &mode,
            width,
            height,
            *score,
        )?;
    }

    ensure_same_run(ctx, &job.id, claimed_started_at)?;
    ctx.store
        .update_job(&job.id, &JobUpdate::progress(0.99, "finalizing"))?;
    ctx.store.upsert_video_keyframe_index(
        &video_id,
        &KeyframeIndexState {
            status: "completed".into(),
            progress: 1.0,
            message: "completed".into(),
            params_json: Some(params_json),
            frame_count: total as i64,
            ..Default::default()
        },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_selection_respects_min_gap_and_cap() {
        let candidates = vec![
            (10.0, 0.9),
            (10.5, 0.8), // within min gap of the 0.9 pick
            (30.0, 0.7),
            (55.0, 0.6),
            (80.0, 0.5),
        ];
        let picked = pick_scene_frames(candidates, 100.0, 3, 2.0);

        assert_eq!(picked.len(), 3);
        for pair in picked.windows(2) {
            assert!((pair[1].0 - pair[0].0).abs() >= 2.0);
            // Sorted ascending by time.
            assert!(pair[0].0 < pair[1].0);
        }
        // Highest-scored candidates won; the too-close 0.8 lost.
        assert!(picked.iter().any(|(ts, _)| *ts == 10.0));
        assert!(!picked.iter().any(|(ts, _)| *ts == 10.5));
    }

    #[test]
    fn test_scene_selection_drops_out_of_range() {
        let candidates = vec![(-1.0, 0.9), (5.0, 0.5), (120.0, 0.8)];
        let picked = pick_scene_frames(candidates, 100.0, 10, 0.0);
        assert_eq!(picked, vec![(5.0, 0.5)]);
    }
}
