//! Search and chat: shared index gating, embed-and-query with collection
//! fallback, RAG message assembly, and SSE token streaming.

use super::{accepted, require_video, ApiError, ApiResult};
use crate::app::AppContext;
use crate::embeddings::embed_texts;
use crate::llm::{ChatMessage, LlmPreferences};
use crate::store::VideoIndex;
use crate::vector_store::{chunks_collection_name, QueryResult, LEGACY_COLLECTION_NAME};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;

/// `HH:MM:SS.mmm` rendering used in citations.
pub(super) fn format_seconds(seconds: Option<f64>) -> String {
    let Some(seconds) = seconds else {
        return String::new();
    };
    let mut total_ms = (seconds.max(0.0) * 1000.0).round() as i64;
    let h = total_ms / 3_600_000;
    total_ms -= h * 3_600_000;
    let m = total_ms / 60_000;
    total_ms -= m * 60_000;
    let s = total_ms / 1000;
    let ms = total_ms - s * 1000;
    format!("{h:02}:{m:02}:{s:02}.{ms:03}")
}

/// Retrieval-only chat answer: a header line plus up to `max_snippets`
/// time-stamped snippets.
pub(super) fn retrieval_only_answer(query: &str, items: &[Value], max_snippets: usize) -> String {
    let query = query.trim();
    if items.is_empty() {
        return format!("未配置本地 LLM。未检索到与问题相关的片段：{query}");
    }

    let mut lines = vec![format!("未配置本地 LLM。以下为与问题最相关的片段：{query}")];
    for item in items.iter().take(max_snippets.max(1)) {
        let start = format_seconds(item.get("start_time").and_then(Value::as_f64));
        let end = format_seconds(item.get("end_time").and_then(Value::as_f64));
        let text = item
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or("")
            .replace('\n', " ");
        let text = text.trim();
        let text = if text.chars().count() > 240 {
            let truncated: String = text.chars().take(240).collect();
            format!("{}…", truncated.trim_end())
        } else {
            text.to_string()
        };
        if !start.is_empty() && !end.is_empty() {
            lines.push(format!("[{start} - {end}] {text}"));
        } else {
            lines.push(text);
        }
    }
    lines.join("\n").trim().to_string()
}

/// Outcome of the shared index gate.
enum Gate {
    /// A response was produced (202 in-progress / 202 started / 404).
    Respond(Response),
    /// The index is fresh and completed; proceed to query.
    Ready(VideoIndex),
}

/// Gate shared by search and chat: an active index job wins, then a fresh
/// completed index, otherwise a `from_scratch` index job is enqueued.
fn gate_index(ctx: &AppContext, video_id: &str) -> ApiResult<Gate> {
    if let Some(existing) = ctx.store.get_active_job_for_video(video_id, "index")? {
        return Ok(Gate::Respond(accepted(
            "INDEXING_IN_PROGRESS",
            &existing.id,
            video_id,
        )));
    }

    let index_meta = ctx.store.get_video_index(video_id)?;
    let mut fresh_index = None;
    if let Some(index) = &index_meta {
        if index.status == "completed" {
            let current_hash = ctx.transcripts.content_hash(video_id)?;
            let index_hash = index.transcript_hash.as_deref().unwrap_or("");
            if !index_hash.is_empty() && !current_hash.is_empty() && index_hash == current_hash {
                fresh_index = Some(index.clone());
            }
        }
    }

    if let Some(index) = fresh_index {
        return Ok(Gate::Ready(index));
    }

    if !ctx.transcripts.exists(video_id) {
        return Err(ApiError::not_found("TRANSCRIPT_NOT_FOUND"));
    }
    if ctx.transcripts.load(video_id, Some(1))?.is_empty() {
        return Err(ApiError::not_found("TRANSCRIPT_NOT_FOUND"));
    }

    let mut params = serde_json::Map::new();
    params.insert("from_scratch".into(), json!(true));
    if let Some(meta) = &index_meta {
        params.insert(
            "embed_model".into(),
            json!(meta
                .embed_model
                .clone()
                .unwrap_or_else(|| ctx.settings.embedding_model.clone())),
        );
        params.insert(
            "embed_dim".into(),
            json!(meta.embed_dim.unwrap_or(ctx.settings.embedding_dim)),
        );
    }

    let job = ctx
        .store
        .create_job(video_id, "index", &Value::Object(params))?;
    Ok(Gate::Respond(accepted("INDEXING_STARTED", &job.id, video_id)))
}

/// Embed the query and search, retrying the legacy collection when the
/// versioned one does not exist.
fn query_index(
    ctx: &AppContext,
    index: &VideoIndex,
    video_id: &str,
    query: &str,
    top_k: usize,
) -> ApiResult<Vec<Value>> {
    let embed_model = index
        .embed_model
        .clone()
        .unwrap_or_else(|| ctx.settings.embedding_model.clone());
    let embed_dim = index.embed_dim.unwrap_or(ctx.settings.embedding_dim);

    let query_embedding = embed_texts(&[query.to_string()], &embed_model, embed_dim as usize)?
        .into_iter()
        .next()
        .unwrap_or_default();

    let versioned = chunks_collection_name(&embed_model, embed_dim);
    let map_err =
        |_| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "E_VECTOR_STORE_UNAVAILABLE");

    let mut result: QueryResult = ctx
        .vectors
        .query_vectors(&versioned, &query_embedding, top_k, video_id, false)
        .map_err(map_err)?;

    if result.collection_missing {
        result = ctx
            .vectors
            .query_vectors(
                LEGACY_COLLECTION_NAME,
                &query_embedding,
                top_k,
                video_id,
                false,
            )
            .map_err(map_err)?;
    }

    let n = result
        .ids
        .len()
        .min(result.documents.len())
        .min(result.metadatas.len())
        .min(result.distances.len());

    let mut items = Vec::with_capacity(n);
    for i in 0..n {
        let metadata = &result.metadatas[i];
        let distance = result.distances[i];
        let score = if distance >= 0.0 {
            1.0 / (1.0 + distance)
        } else {
            1.0
        };
        items.push(json!({
            "chunk_id": result.ids[i],
            "score": score,
            "start_time": metadata.get("start_time").cloned().unwrap_or(Value::Null),
            "end_time": metadata.get("end_time").cloned().unwrap_or(Value::Null),
            "text": result.documents[i],
            "metadata": metadata,
        }));
    }
    Ok(items)
}

#[derive(Deserialize)]
pub(super) struct SearchQuery {
    query: String,
    video_id: String,
    #[serde(default = "default_top_k")]
    top_k: i64,
}

fn default_top_k() -> i64 {
    5
}

pub(super) async fn search(
    State(ctx): State<Arc<AppContext>>,
    Query(req): Query<SearchQuery>,
) -> ApiResult<Response> {
    let query = req.query.trim().to_string();
    if query.is_empty() {
        return Err(ApiError::bad_request("QUERY_REQUIRED"));
    }
    require_video(&ctx, &req.video_id)?;

    let index = match gate_index(&ctx, &req.video_id)? {
        Gate::Respond(response) => return Ok(response),
        Gate::Ready(index) => index,
    };

    let top_k = req.top_k.clamp(1, 20) as usize;
    let items = query_index(&ctx, &index, &req.video_id, &query, top_k)?;
    Ok(Json(json!({ "items": items })).into_response())
}

#[derive(Deserialize)]
pub(super) struct ChatRequest {
    video_id: String,
    query: String,
    #[serde(default = "default_top_k")]
    top_k: i64,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    confirm_send: bool,
}

fn sse_event(name: &'static str, data: &Value) -> Event {
    match Event::default().event(name).json_data(data) {
        Ok(event) => event,
        Err(_) => Event::default().event(name).data("{}"),
    }
}

/// Wrap a token stream into `token`/`done`/`error` SSE events. The optional
/// limiter guard is held until the stream finishes or the client goes away.
fn chat_sse(
    tokens: BoxStream<'static, crate::error::Result<String>>,
    done_payload_base: Value,
    guard: Option<crate::runtime::OwnedLlmGuard>,
) -> Sse<BoxStream<'static, std::result::Result<Event, Infallible>>> {
    struct StreamState {
        tokens: BoxStream<'static, crate::error::Result<String>>,
        parts: Vec<String>,
        base: Value,
        finished: bool,
        _guard: Option<crate::runtime::OwnedLlmGuard>,
    }

    let stream = futures::stream::unfold(
        StreamState {
            tokens,
            parts: Vec::new(),
            base: done_payload_base,
            finished: false,
            _guard: guard,
        },
        |mut st| async move {
            if st.finished {
                return None;
            }
            match st.tokens.next().await {
                Some(Ok(part)) => {
                    st.parts.push(part.clone());
                    Some((Ok(sse_event("token", &json!({ "delta": part }))), st))
                }
                Some(Err(e)) => {
                    st.finished = true;
                    Some((
                        Ok(sse_event("error", &json!({ "detail": e.to_string() }))),
                        st,
                    ))
                }
                None => {
                    st.finished = true;
                    let mut payload = st.base.clone();
                    payload["answer"] = json!(st.parts.concat());
                    Some((Ok(sse_event("done", &payload)), st))
                }
            }
        },
    );

    Sse::new(stream.boxed())
}

pub(super) async fn chat(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Response> {
    let video_id = req.video_id.trim().to_string();
    if video_id.is_empty() {
        return Err(ApiError::bad_request("VIDEO_ID_REQUIRED"));
    }
    let query = req.query.trim().to_string();
    if query.is_empty() {
        return Err(ApiError::bad_request("QUERY_REQUIRED"));
    }
    require_video(&ctx, &video_id)?;

    let index = match gate_index(&ctx, &video_id)? {
        Gate::Respond(response) => return Ok(response),
        Gate::Ready(index) => index,
    };

    let top_k = req.top_k.clamp(1, 20) as usize;
    let items = query_index(&ctx, &index, &video_id, &query, top_k)?;

    let stored = ctx.store.get_default_llm_preferences()?;
    let prefs = LlmPreferences::from_stored(&stored);

    if prefs.provider == "none" {
        let answer = retrieval_only_answer(&query, &items, 3);
        if req.stream {
            let parts: Vec<crate::error::Result<String>> = answer
                .chars()
                .collect::<Vec<_>>()
                .chunks(16)
                .map(|c| Ok(c.iter().collect()))
                .collect();
            let base = json!({
                "video_id": video_id,
                "query": query,
                "mode": "retrieval_only",
                "citations": items,
            });
            return Ok(chat_sse(futures::stream::iter(parts).boxed(), base, None).into_response());
        }
        return Ok(Json(json!({
            "video_id": video_id,
            "query": query,
            "mode": "retrieval_only",
            "answer": answer,
            "citations": items,
        }))
        .into_response());
    }

    let provider = ctx
        .llm
        .get(&prefs.provider)
        .ok_or_else(|| ApiError::bad_request("LLM_PROVIDER_NOT_FOUND"))?;

    if provider.requires_confirm_send() && !req.confirm_send {
        return Err(ApiError::bad_request("CONFIRM_SEND_REQUIRED"));
    }

    let citations_text = items
        .iter()
        .map(|item| {
            format!(
                "[{} - {}] {}",
                format_seconds(item.get("start_time").and_then(Value::as_f64)),
                format_seconds(item.get("end_time").and_then(Value::as_f64)),
                item.get("text").and_then(Value::as_str).unwrap_or("")
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let messages = vec![
        ChatMessage::system("你是一个本地优先的视频内容整理助手。请基于给定的引用片段回答问题。"),
        ChatMessage::user(format!("问题：{query}\n\n引用片段（带时间戳）：\n{citations_text}")),
    ];

    if req.stream {
        let guard = ctx
            .runtime
            .limit_llm_owned()
            .await
            .map_err(|e| ApiError::new(StatusCode::BAD_GATEWAY, format!("LLM_FAILED:{e}")))?;
        let tokens = provider
            .stream_generate(&messages, &prefs, req.confirm_send)
            .await
            .map_err(|e| ApiError::new(StatusCode::BAD_GATEWAY, format!("LLM_FAILED:{e}")))?;
        let base = json!({
            "video_id": video_id,
            "query": query,
            "mode": "rag",
            "citations": items,
        });
        return Ok(chat_sse(tokens, base, Some(guard)).into_response());
    }

    let answer = {
        let _guard = ctx
            .runtime
            .limit_llm_wait()
            .await
            .map_err(|e| ApiError::new(StatusCode::BAD_GATEWAY, format!("LLM_FAILED:{e}")))?;
        provider
            .generate(&messages, &prefs, req.confirm_send)
            .await
            .map_err(|e| {
                let detail: String = e.to_string().chars().take(2000).collect();
                ApiError::new(StatusCode::BAD_GATEWAY, format!("LLM_FAILED:{detail}"))
            })?
    };

    Ok(Json(json!({
        "video_id": video_id,
        "query": query,
        "mode": "rag",
        "answer": answer,
        "citations": items,
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(Some(0.0)), "00:00:00.000");
        assert_eq!(format_seconds(Some(3661.25)), "01:01:01.250");
        assert_eq!(format_seconds(Some(-5.0)), "00:00:00.000");
        assert_eq!(format_seconds(None), "");
    }

    #[test]
    fn test_retrieval_only_answer_formats_snippets() {
        let items = vec![
            json!({"start_time": 0.0, "end_time": 1.0, "text": "hello world"}),
            json!({"start_time": 1.0, "end_time": 2.0, "text": "x".repeat(500)}),
        ];
        let answer = retrieval_only_answer("greeting", &items, 3);
        assert!(answer.contains("[00:00:00.000 - 00:00:01.000] hello world"));
        assert!(answer.contains('…'));

        let empty = retrieval_only_answer("greeting", &[], 3);
        assert!(empty.contains("未检索到"));
    }
}
