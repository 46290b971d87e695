//! Summarize pipeline: map-reduce over transcript windows with an LLM.
//!
//! Map: one short bullet summary per window, persisted incrementally.
//! Reduce: one Markdown summary over the collected segment summaries.
//! Outline: a strictly-JSON outline, parsed permissively with one fix-up
//! round trip; if still unparsable the raw text is stored as `{"raw": ...}`.

use super::{ensure_same_run, param_bool, param_f64, param_i64, truncate_chars, worker_stopped};
use crate::app::AppContext;
use crate::chunking::{segments_to_time_chunks, ChunkParams};
use crate::error::{Result, SiktError};
use crate::llm::{ChatMessage, LlmPreferences};
use crate::store::{Job, JobUpdate, SummaryState, SummaryUpdate};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::instrument;

/// Pull the JSON-looking core out of an LLM reply: fenced block first, then
/// the widest `[..]` span, then `{..}`.
fn extract_json_text(s: &str) -> String {
    let s = s.trim();
    if s.is_empty() {
        return String::new();
    }

    if s.contains("```") {
        let parts: Vec<&str> = s.split("```").collect();
        if parts.len() >= 3 {
            let mut inner = parts[1].trim_start();
            if let Some(prefix) = inner.get(..4) {
                if prefix.eq_ignore_ascii_case("json") {
                    inner = &inner[4..];
                }
            }
            return inner.trim().to_string();
        }
    }

    if let (Some(l), Some(r)) = (s.find('['), s.rfind(']')) {
        if r > l {
            return s[l..=r].trim().to_string();
        }
    }
    if let (Some(l), Some(r)) = (s.find('{'), s.rfind('}')) {
        if r > l {
            return s[l..=r].trim().to_string();
        }
    }
    s.to_string()
}

/// Parse leniently; failures come back as `{"raw": <text>}` so the caller
/// can decide whether to retry or store as-is.
fn parse_jsonish(s: &str) -> Value {
    let core = extract_json_text(s);
    if core.is_empty() {
        return json!([]);
    }
    match serde_json::from_str::<Value>(&core) {
        Ok(Value::String(inner)) => match serde_json::from_str::<Value>(inner.trim()) {
            Ok(v) => v,
            Err(_) => json!({"raw": inner}),
        },
        Ok(v) => v,
        Err(_) => json!({"raw": core}),
    }
}

fn is_raw(v: &Value) -> bool {
    v.as_object().is_some_and(|o| o.contains_key("raw"))
}

fn looks_like_zh(s: &str) -> bool {
    s.chars()
        .take(400)
        .any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c))
}

/// Requested `zh|en|auto`; `auto` sniffs the first chunk for CJK ideographs.
fn normalize_output_language(requested: &str, hint_text: &str) -> &'static str {
    let lang = requested.trim().to_lowercase();
    match lang.as_str() {
        "en" => "en",
        "auto" => {
            if looks_like_zh(hint_text) {
                "zh"
            } else {
                "en"
            }
        }
        _ => "zh",
    }
}

fn map_prompt(lang: &str, start: f64, end: f64, text: &str) -> (String, String) {
    if lang == "zh" {
        (
            "你是一个视频内容整理助手。你需要对视频转写片段进行简要总结，\
             要求简洁，保留关键事实。请用中文输出。"
                .to_string(),
            format!(
                "时间范围：{start:.2}-{end:.2} 秒\n\n转写：\n{}\n\n\
                 任务：用要点（bullet points）写一段简短总结。",
                truncate_chars(text, 12000)
            ),
        )
    } else {
        (
            "You summarize transcript segments. Be concise and keep key facts. \
             Write in English."
                .to_string(),
            format!(
                "Time range: {start:.2}-{end:.2} seconds\n\nTranscript:\n{}\n\n\
                 Task: write a short bullet-point summary.",
                truncate_chars(text, 12000)
            ),
        )
    }
}

fn reduce_prompt(lang: &str, reduce_input: &str) -> (String, String) {
    if lang == "zh" {
        (
            "你需要编写一份结构化的视频总结（Markdown）。请用中文输出。".to_string(),
            format!(
                "给定带时间戳的片段总结（JSON），请写出一份 Markdown 格式的视频总结，\
                 尽量保留关键时间点。\n\nInput JSON:\n{}",
                truncate_chars(reduce_input, 18000)
            ),
        )
    } else {
        (
            "You write a structured video summary.".to_string(),
            format!(
                "Given segment summaries with timestamps (JSON), write a Markdown \
                 summary with key timestamps.\n\nInput JSON:\n{}",
                truncate_chars(reduce_input, 18000)
            ),
        )
    }
}

fn outline_prompt(lang: &str, reduce_input: &str) -> (String, String) {
    if lang == "zh" {
        (
            "你只输出 JSON，不要输出其他内容。".to_string(),
            format!(
                "从片段总结 JSON 生成视频大纲，输出一个 JSON 数组。\
                 每个条目包含：title, start_time, end_time, bullets（字符串数组）。\
                 字段名固定为这些，但 title/bullets 的内容请用中文。只输出 JSON。\n\n\
                 Input JSON:\n{}",
                truncate_chars(reduce_input, 18000)
            ),
        )
    } else {
        (
            "You produce JSON only.".to_string(),
            format!(
                "From the segment summaries JSON, generate an outline as a JSON \
                 array. Each item: title, start_time, end_time, bullets (array of \
                 strings). Output JSON only.\n\nInput JSON:\n{}",
                truncate_chars(reduce_input, 18000)
            ),
        )
    }
}

fn fix_prompt(lang: &str, raw_text: &str) -> (String, String) {
    if lang == "zh" {
        (
            "你只输出有效的 JSON，不要输出其他内容。".to_string(),
            format!(
                "请将以下内容修正为有效的 JSON 数组大纲。只输出 JSON。\n\n{}",
                truncate_chars(raw_text, 12000)
            ),
        )
    } else {
        (
            "You output valid JSON only.".to_string(),
            format!(
                "Fix the following into a valid JSON array outline. Output JSON only.\n\n{}",
                truncate_chars(raw_text, 12000)
            ),
        )
    }
}

#[instrument(skip_all, fields(job_id = %job.id, video_id = %job.video_id))]
pub(super) async fn run(
    ctx: &AppContext,
    stop: &AtomicBool,
    job: &Job,
    claimed_started_at: &str,
) -> Result<()> {
    let video_id = job.video_id.clone();
    ctx.store
        .get_video(&video_id)?
        .ok_or_else(|| SiktError::pipeline("E_INTERNAL", format!("video not found: {video_id}")))?;

    if !ctx.transcripts.exists(&video_id) {
        return Err(SiktError::pipeline("TRANSCRIPT_NOT_FOUND", "transcript missing"));
    }
    let segments = ctx.transcripts.load(&video_id, None)?;
    if segments.is_empty() {
        return Err(SiktError::pipeline("TRANSCRIPT_NOT_FOUND", "transcript empty"));
    }

    let stored = ctx.store.get_default_llm_preferences()?;
    let prefs = LlmPreferences::from_stored(&stored);
    if prefs.provider == "none" {
        return Err(SiktError::pipeline("LLM_PROVIDER_NONE", "no LLM provider configured"));
    }
    let provider = ctx
        .llm
        .get(&prefs.provider)
        .ok_or_else(|| SiktError::pipeline("LLM_PROVIDER_NOT_FOUND", prefs.provider.clone()))?;
    if provider.requires_confirm_send() {
        return Err(SiktError::pipeline(
            "CONFIRM_SEND_REQUIRED",
            "provider requires confirm_send",
        ));
    }

    let reduce_prefs = prefs
        .clone()
        .with_min_max_tokens(param_i64(&job.params, "reduce_max_tokens").unwrap_or(2048));
    let outline_prefs = prefs
        .clone()
        .with_min_max_tokens(param_i64(&job.params, "outline_max_tokens").unwrap_or(2048));

    let transcript_hash = ctx.transcripts.content_hash(&video_id)?;
    if param_bool(&job.params, "from_scratch") {
        ctx.store.delete_video_summary(&video_id)?;
    }

    let chunk_params = ChunkParams {
        target_window_seconds: param_f64(&job.params, "target_window_seconds").unwrap_or(120.0),
        max_window_seconds: param_f64(&job.params, "max_window_seconds").unwrap_or(180.0),
        min_window_seconds: param_f64(&job.params, "min_window_seconds").unwrap_or(60.0),
        overlap_seconds: param_f64(&job.params, "overlap_seconds").unwrap_or(10.0),
    };
    let chunks = segments_to_time_chunks(&segments, &chunk_params);
    if chunks.is_empty() {
        return Err(SiktError::pipeline("NO_TEXT", "no summarizable text"));
    }

    let output_language = normalize_output_language(
        stored
            .get("output_language")
            .and_then(Value::as_str)
            .unwrap_or("zh"),
        &chunks[0].text,
    );

    let params_json = serde_json::to_string(&job.params)?;
    ctx.store.upsert_video_summary(
        &video_id,
        &SummaryState {
            status: "running".into(),
            progress: 0.0,
            message: "starting".into(),
            transcript_hash: Some(transcript_hash.clone()),
            params_json: Some(params_json.clone()),
            ..Default::default()
        },
    )?;

    // Map phase.
    let mut segment_summaries: Vec<Value> = Vec::new();
    let total = chunks.len();
    for (i, chunk) in chunks.iter().enumerate() {
        if stop.load(Ordering::Relaxed) {
            return Err(worker_stopped());
        }
        ensure_same_run(ctx, &job.id, claimed_started_at)?;

        let text = chunk.text.trim();
        if text.is_empty() {
            continue;
        }

        let (system, user) = map_prompt(output_language, chunk.start_time, chunk.end_time, text);
        let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
        let part = {
            let _guard = ctx.runtime.limit_llm().await?;
            provider.generate(&messages, &prefs, false).await?
        };

        segment_summaries.push(json!({
            "start_time": chunk.start_time,
            "end_time": chunk.end_time,
            "summary": part.trim(),
        }));

        let progress = 0.05 + 0.7 * ((i + 1) as f64 / total.max(1) as f64);
        ctx.store
            .update_job(&job.id, &JobUpdate::progress(progress, "summarizing"))?;
        ctx.store.update_video_summary(
            &video_id,
            &SummaryUpdate {
                status: Some("running".into()),
                progress: Some(progress),
                message: Some("summarizing".into()),
                segment_summaries_json: Some(serde_json::to_string(&segment_summaries)?),
                transcript_hash: Some(transcript_hash.clone()),
                params_json: Some(params_json.clone()),
                ..Default::default()
            },
        )?;
    }

    // Reduce phase.
    ensure_same_run(ctx, &job.id, claimed_started_at)?;
    ctx.store
        .update_job(&job.id, &JobUpdate::progress(0.8, "reducing"))?;
    ctx.store.update_video_summary(
        &video_id,
        &SummaryUpdate {
            status: Some("running".into()),
            progress: Some(0.8),
            message: Some("reducing".into()),
            ..Default::default()
        },
    )?;

    let reduce_input = serde_json::to_string(&segment_summaries)?;
    let (system, user) = reduce_prompt(output_language, &reduce_input);
    let summary_md = {
        let _guard = ctx.runtime.limit_llm().await?;
        provider
            .generate(
                &[ChatMessage::system(system), ChatMessage::user(user)],
                &reduce_prefs,
                false,
            )
            .await?
    };

    // Outline phase.
    ensure_same_run(ctx, &job.id, claimed_started_at)?;
    ctx.store
        .update_job(&job.id, &JobUpdate::progress(0.9, "outline"))?;

    let (system, user) = outline_prompt(output_language, &reduce_input);
    let outline_raw = {
        let _guard = ctx.runtime.limit_llm().await?;
        provider
            .generate(
                &[ChatMessage::system(system), ChatMessage::user(user)],
                &outline_prefs,
                false,
            )
            .await?
    };

    let mut outline = parse_jsonish(&outline_raw);
    if is_raw(&outline) {
        let raw_text = outline["raw"].as_str().unwrap_or("").to_string();
        let (system, user) = fix_prompt(output_language, &raw_text);
        let fixed_raw = {
            let _guard = ctx.runtime.limit_llm().await?;
            provider
                .generate(
                    &[ChatMessage::system(system), ChatMessage::user(user)],
                    &outline_prefs,
                    false,
                )
                .await?
        };
        let fixed = parse_jsonish(&fixed_raw);
        if !is_raw(&fixed) {
            outline = fixed;
        }
    }

    ensure_same_run(ctx, &job.id, claimed_started_at)?;
    ctx.store
        .update_job(&job.id, &JobUpdate::progress(0.99, "finalizing"))?;
    ctx.store.update_video_summary(
        &video_id,
        &SummaryUpdate {
            status: Some("completed".into()),
            progress: Some(1.0),
            message: Some("completed".into()),
            transcript_hash: Some(transcript_hash),
            params_json: Some(params_json),
            segment_summaries_json: Some(serde_json::to_string(&segment_summaries)?),
            summary_markdown: Some(summary_md),
            outline_json: Some(serde_json::to_string(&outline)?),
            ..Default::default()
        },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fenced_block() {
        let s = "Here you go:\n```json\n[{\"title\": \"a\"}]\n```\nthanks";
        assert_eq!(extract_json_text(s), "[{\"title\": \"a\"}]");

        let s = "```\n{\"k\": 1}\n```";
        assert_eq!(extract_json_text(s), "{\"k\": 1}");
    }

    #[test]
    fn test_extract_json_bracket_span() {
        let s = "noise before [1, 2, 3] noise after";
        assert_eq!(extract_json_text(s), "[1, 2, 3]");

        let s = "object { \"a\": 1 } trailing";
        assert_eq!(extract_json_text(s), "{ \"a\": 1 }");
    }

    #[test]
    fn test_parse_jsonish_fallback_to_raw() {
        let parsed = parse_jsonish("not json at all");
        assert_eq!(parsed["raw"], "not json at all");

        let parsed = parse_jsonish("[{\"title\": \"ok\"}]");
        assert!(parsed.is_array());

        // A JSON string containing JSON is unwrapped.
        let parsed = parse_jsonish("\"[1,2]\"");
        assert_eq!(parsed, json!([1, 2]));
    }

    #[test]
    fn test_normalize_output_language() {
        assert_eq!(normalize_output_language("zh", ""), "zh");
        assert_eq!(normalize_output_language("en", "你好"), "en");
        assert_eq!(normalize_output_language("auto", "你好世界"), "zh");
        assert_eq!(normalize_output_language("auto", "hello world"), "en");
        assert_eq!(normalize_output_language("klingon", ""), "zh");
    }
}
