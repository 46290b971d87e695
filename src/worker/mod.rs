//! Long-lived job worker.
//!
//! One loop pulls the oldest pending job, claims it with a conditional
//! update, and dispatches to the matching pipeline. The `started_at` stamped
//! by the claim is the run's epoch token: before every externally-visible
//! write and around every long external call, pipelines re-read the job row
//! and bail with `JobCancelled` if the status or epoch changed. Cancellation
//! therefore needs no signals; it is observed at the next checkpoint, and a
//! cancel-then-retry race cannot resurrect the old run's writes because the
//! retried run carries a different epoch.

mod index;
mod keyframes;
mod summarize;
mod transcribe;

use crate::app::AppContext;
use crate::error::{Result, SiktError};
use crate::store::{ArtifactKind, Job, JobUpdate};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Re-read the job and confirm it is still this run; the cooperative
/// cancellation checkpoint.
pub(crate) fn ensure_same_run(
    ctx: &AppContext,
    job_id: &str,
    claimed_started_at: &str,
) -> Result<Job> {
    let job = ctx
        .store
        .get_job(job_id)?
        .ok_or_else(|| SiktError::pipeline("E_INTERNAL", format!("job not found: {job_id}")))?;

    if job.status != "running" {
        return Err(SiktError::JobCancelled);
    }
    if job.started_at.as_deref().unwrap_or("") != claimed_started_at {
        return Err(SiktError::JobCancelled);
    }
    Ok(job)
}

pub(crate) fn param_bool(params: &Value, key: &str) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(false)
}

pub(crate) fn param_f64(params: &Value, key: &str) -> Option<f64> {
    params.get(key).and_then(Value::as_f64)
}

pub(crate) fn param_i64(params: &Value, key: &str) -> Option<i64> {
    params.get(key).and_then(Value::as_i64)
}

pub(crate) fn param_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

pub(crate) fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

fn worker_stopped() -> SiktError {
    SiktError::pipeline("E_INTERNAL", "worker stopped")
}

/// The single long-lived job worker.
pub struct JobWorker {
    ctx: Arc<AppContext>,
    stop: Arc<AtomicBool>,
    last_refresh: Option<Instant>,
}

impl JobWorker {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            stop: Arc::new(AtomicBool::new(false)),
            last_refresh: None,
        }
    }

    /// Handle used to request a shutdown from outside the loop.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    fn maybe_refresh_runtime_preferences(&mut self) {
        let due = match self.last_refresh {
            Some(last) => last.elapsed() >= Duration::from_secs(2),
            None => true,
        };
        if !due {
            return;
        }
        self.last_refresh = Some(Instant::now());
        if let Err(e) = self.ctx.refresh_runtime_preferences() {
            warn!("Failed to refresh runtime preferences: {e}");
        }
    }

    /// Pull, claim, and execute jobs until stopped.
    pub async fn run_forever(mut self) {
        info!("Job worker started");
        self.maybe_refresh_runtime_preferences();

        while !self.stop.load(Ordering::Relaxed) {
            self.maybe_refresh_runtime_preferences();

            let job = match self.ctx.store.fetch_next_pending_job() {
                Ok(Some(job)) => job,
                Ok(None) => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
                Err(e) => {
                    error!("Failed to fetch pending job: {e}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };

            self.maybe_refresh_runtime_preferences();

            if let Err(e) = self.execute(job).await {
                // Store-level failures while bookkeeping; the loop goes on.
                error!("Worker bookkeeping failed: {e}");
            }
        }
        info!("Job worker stopped");
    }

    async fn execute(&mut self, job: Job) -> Result<()> {
        let ctx = self.ctx.clone();
        let job_id = job.id.clone();
        let video_id = job.video_id.clone();
        let job_type = job.job_type.clone();

        if !ctx.store.claim_pending_job(&job_id)? {
            return Ok(());
        }

        let claimed = ctx.store.get_job(&job_id)?.unwrap_or(job);
        let claimed_started_at = match claimed.started_at.clone() {
            Some(epoch) if !epoch.is_empty() => epoch,
            _ => {
                ctx.store.update_job(
                    &job_id,
                    &JobUpdate {
                        status: Some("failed".into()),
                        progress: Some(0.0),
                        message: Some("failed".into()),
                        error_code: Some("E_INTERNAL".into()),
                        error_message: Some("job claimed but started_at missing".into()),
                        ..Default::default()
                    },
                )?;
                if job_type == "transcribe" {
                    ctx.store.set_video_status(&video_id, "error")?;
                }
                return Ok(());
            }
        };

        self.maybe_refresh_runtime_preferences();

        ctx.store
            .update_job(&job_id, &JobUpdate::progress(0.0, "starting"))?;
        if job_type == "transcribe" {
            ctx.store.set_video_status(&video_id, "processing")?;
        }

        info!("Running job {job_id} type={job_type} video={video_id}");

        let outcome = match job_type.as_str() {
            "transcribe" => {
                transcribe::run(&ctx, &self.stop, &claimed, &claimed_started_at).await
            }
            "index" => index::run(&ctx, &claimed, &claimed_started_at).await,
            "keyframes" => keyframes::run(&ctx, &self.stop, &claimed, &claimed_started_at).await,
            "summarize" => summarize::run(&ctx, &self.stop, &claimed, &claimed_started_at).await,
            other => Err(SiktError::pipeline(
                "E_INTERNAL",
                format!("unsupported job_type: {other}"),
            )),
        };

        match outcome {
            Ok(()) => {
                // A pipeline may have finalized the job itself (early
                // failure) or lost its epoch; only a still-running job gets
                // the completion write.
                let status = ctx.store.get_job_status(&job_id)?;
                if status.as_deref() != Some("running") {
                    if job_type == "transcribe" {
                        ctx.store.set_video_status(&video_id, "pending")?;
                    }
                    return Ok(());
                }

                ctx.store.update_job(
                    &job_id,
                    &JobUpdate {
                        status: Some("completed".into()),
                        progress: Some(1.0),
                        message: Some("completed".into()),
                        ..Default::default()
                    },
                )?;
                if job_type == "transcribe" {
                    ctx.store.set_video_status(&video_id, "complete")?;
                }
            }
            Err(SiktError::JobCancelled) => {
                self.write_cancelled(&job_type, &video_id)?;
            }
            Err(e) => {
                // Cancellation supersedes failure: if the job was cancelled
                // while the error was in flight, honor the cancel.
                if ctx.store.get_job_status(&job_id)?.as_deref() == Some("cancelled") {
                    self.write_cancelled(&job_type, &video_id)?;
                    return Ok(());
                }

                let detail = truncate_chars(&e.to_string(), 2000);
                let code = match &e {
                    SiktError::ConcurrencyTimeout(_) => "E_CONCURRENCY_TIMEOUT",
                    _ if job_type == "transcribe" => "E_ASR_FAILED",
                    _ => "E_JOB_FAILED",
                };
                warn!("Job {job_id} failed: {code}: {detail}");

                ctx.store.update_job(
                    &job_id,
                    &JobUpdate {
                        status: Some("failed".into()),
                        progress: Some(0.0),
                        message: Some("failed".into()),
                        error_code: Some(code.into()),
                        error_message: Some(detail.clone()),
                        result: Some(serde_json::json!({
                            "trace": truncate_chars(&format!("{e:?}"), 4000),
                        })),
                        ..Default::default()
                    },
                )?;

                match job_type.as_str() {
                    "transcribe" => ctx.store.set_video_status(&video_id, "error")?,
                    "index" => ctx.store.update_artifact_status(
                        ArtifactKind::Index,
                        &video_id,
                        "failed",
                        Some(0.0),
                        "failed",
                        Some("E_JOB_FAILED"),
                        Some(detail.as_str()),
                    )?,
                    "keyframes" => ctx.store.update_artifact_status(
                        ArtifactKind::KeyframeIndex,
                        &video_id,
                        "failed",
                        Some(0.0),
                        "failed",
                        Some("E_JOB_FAILED"),
                        Some(detail.as_str()),
                    )?,
                    "summarize" => ctx.store.update_artifact_status(
                        ArtifactKind::Summary,
                        &video_id,
                        "failed",
                        Some(0.0),
                        "failed",
                        Some("E_JOB_FAILED"),
                        Some(detail.as_str()),
                    )?,
                    _ => {}
                }
            }
        }

        Ok(())
    }

    fn write_cancelled(&self, job_type: &str, video_id: &str) -> Result<()> {
        match job_type {
            "transcribe" => self.ctx.store.set_video_status(video_id, "pending"),
            "index" => self.ctx.store.update_artifact_status(
                ArtifactKind::Index,
                video_id,
                "cancelled",
                None,
                "cancelled",
                None,
                None,
            ),
            "keyframes" => self.ctx.store.update_artifact_status(
                ArtifactKind::KeyframeIndex,
                video_id,
                "cancelled",
                None,
                "cancelled",
                None,
                None,
            ),
            "summarize" => self.ctx.store.update_artifact_status(
                ArtifactKind::Summary,
                video_id,
                "cancelled",
                None,
                "cancelled",
                None,
                None,
            ),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asr::{AsrSegment, Transcriber};
    use crate::config::Settings;
    use async_trait::async_trait;
    use std::path::Path;

    struct SilentTranscriber;

    #[async_trait]
    impl Transcriber for SilentTranscriber {
        async fn transcribe_wav(&self, _wav_path: &Path) -> crate::error::Result<Vec<AsrSegment>> {
            Ok(Vec::new())
        }
    }

    fn test_ctx() -> (tempfile::TempDir, Arc<AppContext>) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::with_data_dir(dir.path());
        let ctx = AppContext::with_transcriber(settings, Arc::new(SilentTranscriber)).unwrap();
        (dir, ctx)
    }

    #[test]
    fn test_ensure_same_run_detects_cancel_and_epoch_change() {
        let (_dir, ctx) = test_ctx();
        let video = ctx
            .store
            .create_or_get_video("/tmp/a.mp4", "h1", 10.0, 1)
            .unwrap();
        let job = ctx
            .store
            .create_job(&video.id, "index", &serde_json::json!({}))
            .unwrap();
        ctx.store.claim_pending_job(&job.id).unwrap();
        let epoch = ctx
            .store
            .get_job(&job.id)
            .unwrap()
            .unwrap()
            .started_at
            .unwrap();

        assert!(ensure_same_run(&ctx, &job.id, &epoch).is_ok());

        // Cancelled: checkpoint trips.
        ctx.store.cancel_job(&job.id).unwrap();
        assert!(matches!(
            ensure_same_run(&ctx, &job.id, &epoch),
            Err(SiktError::JobCancelled)
        ));

        // Retried under a new epoch: the old run's checkpoint still trips.
        ctx.store.reset_job(&job.id).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        ctx.store.claim_pending_job(&job.id).unwrap();
        assert!(matches!(
            ensure_same_run(&ctx, &job.id, &epoch),
            Err(SiktError::JobCancelled)
        ));
    }

    #[tokio::test]
    async fn test_unsupported_job_type_fails_with_internal_detail() {
        let (_dir, ctx) = test_ctx();
        let video = ctx
            .store
            .create_or_get_video("/tmp/a.mp4", "h1", 10.0, 1)
            .unwrap();
        let job = ctx
            .store
            .create_job(&video.id, "mystery", &serde_json::json!({}))
            .unwrap();

        let mut worker = JobWorker::new(ctx.clone());
        let fetched = ctx.store.fetch_next_pending_job().unwrap().unwrap();
        worker.execute(fetched).await.unwrap();

        let failed = ctx.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(failed.status, "failed");
        assert_eq!(failed.error_code.as_deref(), Some("E_JOB_FAILED"));
        assert!(failed
            .error_message
            .unwrap()
            .contains("unsupported job_type"));
        assert!(failed.result.unwrap()["trace"].is_string());
    }

    #[tokio::test]
    async fn test_index_pipeline_end_to_end() {
        let (_dir, ctx) = test_ctx();
        let video = ctx
            .store
            .create_or_get_video("/tmp/a.mp4", "h1", 12.0, 1)
            .unwrap();
        ctx.transcripts
            .append(
                &video.id,
                &[
                    crate::transcript_store::Segment::new(0.0, 6.0, "hello world."),
                    crate::transcript_store::Segment::new(6.0, 12.0, "more text here."),
                ],
            )
            .unwrap();

        let job = ctx
            .store
            .create_job(
                &video.id,
                "index",
                &serde_json::json!({
                    "from_scratch": true,
                    "embed_model": "hash",
                    "embed_dim": 16,
                    "target_window_seconds": 5.0,
                    "max_window_seconds": 10.0,
                    "min_window_seconds": 2.0,
                    "overlap_seconds": 0.0,
                }),
            )
            .unwrap();

        let mut worker = JobWorker::new(ctx.clone());
        let fetched = ctx.store.fetch_next_pending_job().unwrap().unwrap();
        worker.execute(fetched).await.unwrap();

        let done = ctx.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(done.status, "completed");
        assert_eq!(done.progress, 1.0);

        let index = ctx.store.get_video_index(&video.id).unwrap().unwrap();
        assert_eq!(index.status, "completed");
        assert_eq!(index.chunk_count, 2);
        assert_eq!(index.indexed_count, 2);
        assert_eq!(
            index.transcript_hash.as_deref().unwrap(),
            ctx.transcripts.content_hash(&video.id).unwrap()
        );

        // Chunk rows are dense 1..N with content hashes over the text.
        let chunks = ctx.store.list_chunks(&video.id, 50, 0).unwrap();
        let indexes: Vec<i64> = chunks.items.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indexes, vec![1, 2]);
        for chunk in &chunks.items {
            assert_eq!(chunk.content_hash, crate::hashing::sha256_text(&chunk.text));
            assert!(chunk.start_time < chunk.end_time);
        }

        // Vectors landed in the versioned collection for this video.
        let collection = crate::vector_store::chunks_collection_name("hash", 16);
        let query = crate::embeddings::embed_texts(&["hello".to_string()], "hash", 16).unwrap();
        let result = ctx
            .vectors
            .query_vectors(&collection, &query[0], 10, &video.id, false)
            .unwrap();
        assert_eq!(result.ids.len(), 2);
    }

    #[tokio::test]
    async fn test_summarize_pipeline_with_fake_provider() {
        let (_dir, ctx) = test_ctx();
        let video = ctx
            .store
            .create_or_get_video("/tmp/a.mp4", "h1", 2.0, 1)
            .unwrap();
        ctx.transcripts
            .append(
                &video.id,
                &[crate::transcript_store::Segment::new(0.0, 1.0, "hello world")],
            )
            .unwrap();

        let job = ctx
            .store
            .create_job(&video.id, "summarize", &serde_json::json!({}))
            .unwrap();

        let mut worker = JobWorker::new(ctx.clone());
        let fetched = ctx.store.fetch_next_pending_job().unwrap().unwrap();
        worker.execute(fetched).await.unwrap();

        let done = ctx.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(done.status, "completed");

        let summary = ctx.store.get_video_summary(&video.id).unwrap().unwrap();
        assert_eq!(summary.status, "completed");
        assert!(summary.summary_markdown.unwrap().starts_with("[FAKE:"));
        assert_eq!(
            summary.transcript_hash.as_deref().unwrap(),
            ctx.transcripts.content_hash(&video.id).unwrap()
        );

        let segment_summaries = summary.segment_summaries.unwrap();
        assert_eq!(segment_summaries.as_array().unwrap().len(), 1);

        // The fake echo is never valid JSON, so the outline falls back to
        // the raw form even after the fix-up round trip.
        let outline: serde_json::Value =
            serde_json::from_str(summary.outline_json.as_deref().unwrap()).unwrap();
        assert!(outline.get("raw").is_some());
    }

    #[tokio::test]
    async fn test_summarize_without_transcript_fails_job() {
        let (_dir, ctx) = test_ctx();
        let video = ctx
            .store
            .create_or_get_video("/tmp/missing-file.mp4", "h1", 10.0, 1)
            .unwrap();
        let job = ctx
            .store
            .create_job(&video.id, "summarize", &serde_json::json!({}))
            .unwrap();

        let mut worker = JobWorker::new(ctx.clone());
        let fetched = ctx.store.fetch_next_pending_job().unwrap().unwrap();
        worker.execute(fetched).await.unwrap();

        let failed = ctx.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(failed.status, "failed");
        assert_eq!(failed.error_code.as_deref(), Some("E_JOB_FAILED"));
        assert!(failed.error_message.unwrap().contains("TRANSCRIPT_NOT_FOUND"));
    }
}
