//! Transcribe pipeline: window the media, extract audio, run ASR, append to
//! the transcript log. Resume-from-partial works by rewinding one overlap
//! behind the last logged end time and dropping any recognized segment whose
//! absolute end falls at or before the resume point.

use super::{ensure_same_run, param_bool, param_i64, worker_stopped};
use crate::app::AppContext;
use crate::error::{Result, SiktError};
use crate::media;
use crate::store::{Job, JobUpdate};
use crate::transcript_store::Segment;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, instrument};

#[instrument(skip_all, fields(job_id = %job.id, video_id = %job.video_id))]
pub(super) async fn run(
    ctx: &AppContext,
    stop: &AtomicBool,
    job: &Job,
    claimed_started_at: &str,
) -> Result<()> {
    let video = ctx
        .store
        .get_video(&job.video_id)?
        .ok_or_else(|| SiktError::pipeline("E_INTERNAL", format!("video not found: {}", job.video_id)))?;

    let media_path = std::path::PathBuf::from(&video.file_path);
    let duration = video.duration;

    if param_bool(&job.params, "from_scratch") {
        ctx.transcripts.delete(&job.video_id)?;
    }

    let segment_s = param_i64(&job.params, "segment_seconds")
        .filter(|v| *v > 0)
        .unwrap_or(ctx.settings.segment_seconds) as f64;
    let overlap_s = param_i64(&job.params, "overlap_seconds")
        .filter(|v| *v >= 0)
        .unwrap_or(ctx.settings.overlap_seconds) as f64;

    let last_end = ctx.transcripts.last_end_time(&job.video_id)?;
    let resume_from = last_end;
    let mut start = if last_end > 0.0 {
        (last_end - overlap_s).max(0.0)
    } else {
        0.0
    };
    debug!("Transcribing from {start:.1}s (resume_from={resume_from:.1}s)");

    let mut chunk_index = 0u32;
    while start < duration {
        if stop.load(Ordering::Relaxed) {
            return Err(worker_stopped());
        }
        ensure_same_run(ctx, &job.id, claimed_started_at)?;

        chunk_index += 1;
        let chunk_dur = segment_s.min(duration - start);
        let progress = (start / duration.max(1e-6)).min(0.999);

        ctx.store.update_job(
            &job.id,
            &JobUpdate::progress(
                progress,
                format!("extract_audio chunk={chunk_index} start={start:.1}s"),
            ),
        )?;

        // Scoped temp dir: the WAV slice lives only for this window.
        {
            let tmp = tempfile::Builder::new().prefix("sikt_asr_").tempdir()?;
            let wav_path = tmp.path().join("chunk.wav");

            ensure_same_run(ctx, &job.id, claimed_started_at)?;
            media::extract_audio_wav(&media_path, &wav_path, start, Some(chunk_dur)).await?;

            ensure_same_run(ctx, &job.id, claimed_started_at)?;
            ctx.store.update_job(
                &job.id,
                &JobUpdate::progress(progress, format!("transcribe chunk={chunk_index}")),
            )?;

            ensure_same_run(ctx, &job.id, claimed_started_at)?;
            let segments = {
                let _guard = ctx.runtime.limit_asr().await?;
                ctx.asr.transcribe_wav(&wav_path).await?
            };

            ensure_same_run(ctx, &job.id, claimed_started_at)?;

            let out: Vec<Segment> = segments
                .into_iter()
                .filter_map(|seg| {
                    let abs_start = start + seg.start;
                    let abs_end = start + seg.end;
                    // Anti-duplicate for resumed runs.
                    if abs_end <= resume_from {
                        return None;
                    }
                    Some(Segment {
                        start: abs_start,
                        end: abs_end,
                        text: seg.text.trim().to_string(),
                        language: seg.language,
                    })
                })
                .collect();

            if !out.is_empty() {
                ctx.transcripts.append(&job.video_id, &out)?;
            }
        }

        start += chunk_dur;
        ensure_same_run(ctx, &job.id, claimed_started_at)?;
        ctx.store.update_job(
            &job.id,
            &JobUpdate::progress(
                (start / duration.max(1e-6)).min(0.999),
                format!("chunk_done chunk={chunk_index}"),
            ),
        )?;
    }

    ensure_same_run(ctx, &job.id, claimed_started_at)?;
    ctx.store
        .update_job(&job.id, &JobUpdate::message("finalizing"))?;
    Ok(())
}
