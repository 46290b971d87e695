//! Index pipeline: time-window the transcript, persist chunk rows, embed,
//! and upsert vectors into the versioned collection. Early failures finalize
//! the job and index row themselves and return cleanly, so the outer loop's
//! completion write is skipped.

use super::{ensure_same_run, param_bool, param_f64, param_i64, param_str, truncate_chars};
use crate::app::AppContext;
use crate::chunking::{segments_to_time_chunks, ChunkParams};
use crate::embeddings::embed_texts;
use crate::error::{Result, SiktError};
use crate::hashing::sha256_text;
use crate::store::{IndexState, Job, JobUpdate};
use crate::vector_store::{chunks_collection_name, LEGACY_COLLECTION_NAME};
use serde_json::json;
use tracing::{instrument, warn};

fn base_state(
    embed_model: &str,
    embed_dim: i64,
    chunk_params_json: &str,
    transcript_hash: Option<&str>,
) -> IndexState {
    IndexState {
        embed_model: Some(embed_model.to_string()),
        embed_dim: Some(embed_dim),
        chunk_params_json: Some(chunk_params_json.to_string()),
        transcript_hash: transcript_hash.map(str::to_string),
        ..Default::default()
    }
}

fn fail(
    ctx: &AppContext,
    job: &Job,
    state: IndexState,
    code: &'static str,
    message: &str,
) -> Result<()> {
    ctx.store.upsert_video_index(
        &job.video_id,
        &IndexState {
            status: "failed".into(),
            progress: 0.0,
            message: "failed".into(),
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            ..state
        },
    )?;
    ctx.store.update_job(
        &job.id,
        &JobUpdate {
            status: Some("failed".into()),
            progress: Some(0.0),
            message: Some("failed".into()),
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            ..Default::default()
        },
    )?;
    Ok(())
}

#[instrument(skip_all, fields(job_id = %job.id, video_id = %job.video_id))]
pub(super) async fn run(ctx: &AppContext, job: &Job, claimed_started_at: &str) -> Result<()> {
    let video_id = job.video_id.clone();
    ctx.store
        .get_video(&video_id)?
        .ok_or_else(|| SiktError::pipeline("E_INTERNAL", format!("video not found: {video_id}")))?;

    let mut embed_model = param_str(&job.params, "embed_model")
        .unwrap_or(&ctx.settings.embedding_model)
        .to_string();
    let embed_dim = param_i64(&job.params, "embed_dim").unwrap_or(ctx.settings.embedding_dim);

    let chunk_params = ChunkParams {
        target_window_seconds: param_f64(&job.params, "target_window_seconds")
            .unwrap_or(ctx.settings.index_target_window_seconds),
        max_window_seconds: param_f64(&job.params, "max_window_seconds")
            .unwrap_or(ctx.settings.index_max_window_seconds),
        min_window_seconds: param_f64(&job.params, "min_window_seconds")
            .unwrap_or(ctx.settings.index_min_window_seconds),
        overlap_seconds: param_f64(&job.params, "overlap_seconds")
            .unwrap_or(ctx.settings.index_overlap_seconds),
    };
    let chunk_params_json = json!({
        "target_window_seconds": chunk_params.target_window_seconds,
        "max_window_seconds": chunk_params.max_window_seconds,
        "min_window_seconds": chunk_params.min_window_seconds,
        "overlap_seconds": chunk_params.overlap_seconds,
    })
    .to_string();

    let from_scratch = param_bool(&job.params, "from_scratch");
    let mut collection_name = chunks_collection_name(&embed_model, embed_dim);

    if from_scratch {
        ctx.store.delete_chunks_for_video(&video_id)?;
        for collection in [collection_name.as_str(), LEGACY_COLLECTION_NAME] {
            if let Err(e) = ctx.vectors.delete_video_vectors(collection, &video_id) {
                warn!("Ignoring vector delete failure on {collection}: {e}");
            }
        }
    }

    if !ctx.transcripts.exists(&video_id) {
        return fail(
            ctx,
            job,
            base_state(&embed_model, embed_dim, &chunk_params_json, None),
            "TRANSCRIPT_NOT_FOUND",
            "transcript missing",
        );
    }
    let segments = ctx.transcripts.load(&video_id, None)?;
    if segments.is_empty() {
        return fail(
            ctx,
            job,
            base_state(&embed_model, embed_dim, &chunk_params_json, None),
            "TRANSCRIPT_NOT_FOUND",
            "transcript empty",
        );
    }

    ensure_same_run(ctx, &job.id, claimed_started_at)?;
    let transcript_hash = ctx.transcripts.content_hash(&video_id)?;

    ctx.store.upsert_video_index(
        &video_id,
        &IndexState {
            status: "running".into(),
            progress: 0.0,
            message: "chunking".into(),
            ..base_state(&embed_model, embed_dim, &chunk_params_json, Some(transcript_hash.as_str()))
        },
    )?;
    ctx.store
        .update_job(&job.id, &JobUpdate::progress(0.0, "chunking"))?;

    let chunks = segments_to_time_chunks(&segments, &chunk_params);
    if chunks.is_empty() {
        return fail(
            ctx,
            job,
            base_state(&embed_model, embed_dim, &chunk_params_json, Some(transcript_hash.as_str())),
            "E_CHUNKING_FAILED",
            "no chunks generated",
        );
    }

    let total = chunks.len();
    let mut ids: Vec<String> = Vec::with_capacity(total);
    let mut documents: Vec<String> = Vec::with_capacity(total);
    let mut metadatas: Vec<serde_json::Value> = Vec::with_capacity(total);

    for (i, chunk) in chunks.iter().enumerate() {
        ensure_same_run(ctx, &job.id, claimed_started_at)?;

        let idx = (i + 1) as i64;
        let text = chunk.text.trim();
        if text.is_empty() {
            continue;
        }

        let chunk_id = format!("{video_id}:{idx}");
        let content_hash = sha256_text(text);
        ctx.store.insert_chunk(
            &chunk_id,
            &video_id,
            idx,
            chunk.start_time,
            chunk.end_time,
            text,
            &content_hash,
        )?;

        ids.push(chunk_id);
        documents.push(text.to_string());
        metadatas.push(json!({
            "video_id": video_id,
            "chunk_index": idx,
            "start_time": chunk.start_time,
            "end_time": chunk.end_time,
            "content_hash": content_hash,
            "embed_model": embed_model,
        }));

        if idx % 20 == 0 {
            let progress = ((idx as f64) / (total as f64) * 0.25).min(0.25);
            let message = format!("chunking {idx}/{total}");
            ctx.store
                .update_job(&job.id, &JobUpdate::progress(progress, message.clone()))?;
            ctx.store.upsert_video_index(
                &video_id,
                &IndexState {
                    status: "running".into(),
                    progress,
                    message,
                    chunk_count: ids.len() as i64,
                    ..base_state(
                        &embed_model,
                        embed_dim,
                        &chunk_params_json,
                        Some(transcript_hash.as_str()),
                    )
                },
            )?;
        }
    }

    if ids.is_empty() {
        return fail(
            ctx,
            job,
            base_state(&embed_model, embed_dim, &chunk_params_json, Some(transcript_hash.as_str())),
            "E_CHUNKING_FAILED",
            "all chunks empty",
        );
    }

    ensure_same_run(ctx, &job.id, claimed_started_at)?;
    let embedding_message = format!("embedding 0/{}", ids.len());
    ctx.store
        .update_job(&job.id, &JobUpdate::progress(0.3, embedding_message.clone()))?;
    ctx.store.upsert_video_index(
        &video_id,
        &IndexState {
            status: "running".into(),
            progress: 0.3,
            message: embedding_message,
            chunk_count: ids.len() as i64,
            ..base_state(&embed_model, embed_dim, &chunk_params_json, Some(transcript_hash.as_str()))
        },
    )?;

    let embeddings = match embed_texts(&documents, &embed_model, embed_dim as usize) {
        Ok(embeddings) => embeddings,
        Err(e) => {
            if !embed_model.to_lowercase().starts_with("fastembed") {
                return Err(e);
            }
            // Degrade fastembed models to the deterministic hash embedding.
            warn!("Embedding with {embed_model} failed ({e}); falling back to hash");
            embed_model = "hash".to_string();
            collection_name = chunks_collection_name(&embed_model, embed_dim);
            for metadata in &mut metadatas {
                metadata["embed_model"] = json!("hash");
            }
            if from_scratch {
                if let Err(e) = ctx.vectors.delete_video_vectors(&collection_name, &video_id) {
                    warn!("Ignoring vector delete failure on fallback: {e}");
                }
            }

            let fallback_message = format!("embedding_fallback_hash 0/{}", ids.len());
            ctx.store
                .update_job(&job.id, &JobUpdate::progress(0.3, fallback_message.clone()))?;
            ctx.store.upsert_video_index(
                &video_id,
                &IndexState {
                    status: "running".into(),
                    progress: 0.3,
                    message: fallback_message,
                    chunk_count: ids.len() as i64,
                    ..base_state(
                        &embed_model,
                        embed_dim,
                        &chunk_params_json,
                        Some(transcript_hash.as_str()),
                    )
                },
            )?;

            embed_texts(&documents, &embed_model, embed_dim as usize)?
        }
    };

    if let Err(e) = ctx
        .vectors
        .upsert_vectors(&collection_name, &ids, &documents, &embeddings, &metadatas)
    {
        let detail = truncate_chars(&e.to_string(), 2000);
        return fail(
            ctx,
            job,
            base_state(&embed_model, embed_dim, &chunk_params_json, Some(transcript_hash.as_str())),
            "E_VECTOR_STORE_UNAVAILABLE",
            &detail,
        );
    }

    ensure_same_run(ctx, &job.id, claimed_started_at)?;
    ctx.store
        .update_job(&job.id, &JobUpdate::progress(0.99, "finalizing"))?;
    ctx.store.upsert_video_index(
        &video_id,
        &IndexState {
            status: "completed".into(),
            progress: 1.0,
            message: "completed".into(),
            chunk_count: ids.len() as i64,
            indexed_count: ids.len() as i64,
            ..base_state(&embed_model, embed_dim, &chunk_params_json, Some(transcript_hash.as_str()))
        },
    )?;
    Ok(())
}
