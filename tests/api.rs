//! End-to-end API tests over the in-process router.
//!
//! The worker is not started here; these tests exercise the HTTP layer's
//! validation, idempotency gating, retrieval fallback, and streaming against
//! a real store under a temporary data directory.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use sikt::app::AppContext;
use sikt::asr::{AsrSegment, Transcriber};
use sikt::config::Settings;
use sikt::embeddings::embed_texts;
use sikt::store::{IndexState, KeyframeIndexState};
use sikt::transcript_store::Segment;
use sikt::vector_store::{chunks_collection_name, LEGACY_COLLECTION_NAME};
use std::path::Path;
use std::sync::Arc;
use tower::ServiceExt;

struct SilentTranscriber;

#[async_trait]
impl Transcriber for SilentTranscriber {
    async fn transcribe_wav(&self, _wav_path: &Path) -> sikt::Result<Vec<AsrSegment>> {
        Ok(Vec::new())
    }
}

struct TestApp {
    _dir: tempfile::TempDir,
    ctx: Arc<AppContext>,
    router: Router,
}

fn test_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::with_data_dir(dir.path());
    let ctx = AppContext::with_transcriber(settings, Arc::new(SilentTranscriber)).unwrap();
    let router = sikt::server::router(ctx.clone());
    TestApp {
        _dir: dir,
        ctx,
        router,
    }
}

impl TestApp {
    fn create_video(&self) -> String {
        let video = self
            .ctx
            .store
            .create_or_get_video(
                "/tmp/video.mp4",
                &uuid::Uuid::new_v4().to_string(),
                1.0,
                64,
            )
            .unwrap();
        video.id
    }

    fn write_transcript(&self, video_id: &str) {
        self.ctx
            .transcripts
            .append(video_id, &[Segment::new(0.0, 1.0, "hello world")])
            .unwrap();
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    async fn post(&self, uri: &str, payload: &Value) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(
                Request::post(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(serde_json::to_vec(payload).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    /// Upsert a completed index whose hash matches the current transcript,
    /// and seed vectors for `hello world` into the given collection.
    fn seed_completed_index(&self, video_id: &str, collection: &str) {
        let transcript_hash = self.ctx.transcripts.content_hash(video_id).unwrap();
        self.ctx
            .store
            .upsert_video_index(
                video_id,
                &IndexState {
                    status: "completed".into(),
                    progress: 1.0,
                    message: "completed".into(),
                    embed_model: Some("hash".into()),
                    embed_dim: Some(384),
                    transcript_hash: Some(transcript_hash),
                    chunk_count: 1,
                    indexed_count: 1,
                    ..Default::default()
                },
            )
            .unwrap();

        let embedding = embed_texts(&["hello world".to_string()], "hash", 384).unwrap();
        self.ctx
            .vectors
            .upsert_vectors(
                collection,
                &["c1".to_string()],
                &["hello world".to_string()],
                &embedding,
                &[json!({
                    "video_id": video_id,
                    "start_time": 0.0,
                    "end_time": 1.0,
                })],
            )
            .unwrap();
    }
}

#[tokio::test]
async fn test_health_ok() {
    let app = test_app();
    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_index_requires_transcript() {
    let app = test_app();
    let video_id = app.create_video();

    let (status, body) = app
        .post(
            &format!("/videos/{video_id}/index"),
            &json!({"from_scratch": false}),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["detail"], "TRANSCRIPT_NOT_FOUND");
}

#[tokio::test]
async fn test_search_triggers_index_and_dedupes_chat() {
    let app = test_app();
    let video_id = app.create_video();
    app.write_transcript(&video_id);

    let (status, body) = app
        .get(&format!("/search?video_id={video_id}&query=hello&top_k=3"))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["job_id"].as_str().unwrap().to_string();
    assert!(!job_id.is_empty());

    let (status, body) = app
        .post(
            "/chat",
            &json!({"video_id": video_id, "query": "hello", "top_k": 3}),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["job_id"], job_id.as_str());

    let (status, body) = app
        .get(&format!("/search?video_id={video_id}&query=hello&top_k=3"))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["job_id"], job_id.as_str());
}

#[tokio::test]
async fn test_stale_index_promotes_from_scratch() {
    let app = test_app();
    let video_id = app.create_video();
    app.write_transcript(&video_id);

    app.ctx
        .store
        .upsert_video_index(
            &video_id,
            &IndexState {
                status: "completed".into(),
                progress: 1.0,
                message: "completed".into(),
                embed_model: Some("hash".into()),
                embed_dim: Some(384),
                transcript_hash: Some("stale".into()),
                chunk_count: 1,
                indexed_count: 1,
                ..Default::default()
            },
        )
        .unwrap();

    let (status, body) = app
        .get(&format!("/search?video_id={video_id}&query=hello&top_k=3"))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["detail"], "INDEXING_STARTED");

    let job_id = body["job_id"].as_str().unwrap();
    let job = app.ctx.store.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.params["from_scratch"], true);
}

#[tokio::test]
async fn test_idempotent_keyframes_by_normalized_params() {
    let app = test_app();
    let video_id = app.create_video();

    app.ctx
        .store
        .upsert_video_keyframe_index(
            &video_id,
            &KeyframeIndexState {
                status: "completed".into(),
                progress: 1.0,
                message: "completed".into(),
                params_json: Some(json!({"mode": "interval"}).to_string()),
                frame_count: 1,
                ..Default::default()
            },
        )
        .unwrap();

    let (status, body) = app
        .post(
            &format!("/videos/{video_id}/keyframes"),
            &json!({"mode": "interval"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["detail"], "KEYFRAMES_ALREADY_COMPLETED");

    let (status, body) = app
        .post(
            &format!("/videos/{video_id}/keyframes"),
            &json!({"mode": "scene", "scene_threshold": 0.3}),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["detail"], "KEYFRAMES_STARTED");
}

#[tokio::test]
async fn test_keyframes_in_progress_returns_same_job() {
    let app = test_app();
    let video_id = app.create_video();

    let (status, body) = app
        .post(&format!("/videos/{video_id}/keyframes"), &json!({}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["detail"], "KEYFRAMES_STARTED");
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, body) = app
        .post(&format!("/videos/{video_id}/keyframes"), &json!({}))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["detail"], "KEYFRAMES_IN_PROGRESS");
    assert_eq!(body["job_id"], job_id.as_str());
}

#[tokio::test]
async fn test_versioned_to_legacy_collection_fallback() {
    let app = test_app();
    let video_id = app.create_video();
    app.write_transcript(&video_id);

    // Vectors only exist under the legacy flat name; the versioned
    // collection was never created.
    app.seed_completed_index(&video_id, LEGACY_COLLECTION_NAME);
    assert_ne!(chunks_collection_name("hash", 384), LEGACY_COLLECTION_NAME);

    let (status, body) = app
        .get(&format!("/search?video_id={video_id}&query=hello&top_k=1"))
        .await;
    assert_eq!(status, StatusCode::OK);
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["chunk_id"], "c1");
    assert!(items[0]["score"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn test_search_and_chat_retrieval_only() {
    let app = test_app();
    let video_id = app.create_video();
    app.write_transcript(&video_id);
    app.seed_completed_index(&video_id, &chunks_collection_name("hash", 384));

    app.ctx
        .store
        .set_default_llm_preferences(&json!({"provider": "none"}))
        .unwrap();

    let (status, body) = app
        .get(&format!("/search?video_id={video_id}&query=hello&top_k=1"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"][0]["chunk_id"], "c1");

    let (status, body) = app
        .post(
            "/chat",
            &json!({"video_id": video_id, "query": "hello", "top_k": 1}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "retrieval_only");
    let citations = body["citations"].as_array().unwrap();
    assert_eq!(citations.len(), 1);
    assert_eq!(citations[0]["chunk_id"], "c1");
}

#[tokio::test]
async fn test_chat_sse_with_fake_provider() {
    let app = test_app();
    let video_id = app.create_video();
    app.write_transcript(&video_id);
    app.seed_completed_index(&video_id, &chunks_collection_name("hash", 384));

    let response = app
        .router
        .clone()
        .oneshot(
            Request::post("/chat")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::to_vec(&json!({
                        "video_id": video_id,
                        "query": "hello",
                        "top_k": 1,
                        "stream": true,
                    }))
                    .unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/event-stream"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = String::from_utf8_lossy(&bytes);
    assert!(body.contains("event: token"));
    assert!(body.contains("event: done"));
}

#[tokio::test]
async fn test_chat_requires_query_and_video() {
    let app = test_app();

    let (status, body) = app
        .post("/chat", &json!({"video_id": "", "query": "hi"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "VIDEO_ID_REQUIRED");

    let (status, body) = app
        .post("/chat", &json!({"video_id": "v", "query": "  "}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "QUERY_REQUIRED");

    let (status, body) = app
        .post("/chat", &json!({"video_id": "nope", "query": "hi"}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["detail"], "VIDEO_NOT_FOUND");
}

#[tokio::test]
async fn test_cancel_and_retry_transitions() {
    let app = test_app();
    let video_id = app.create_video();

    let (status, body) = app
        .post(
            "/jobs/transcribe",
            &json!({"video_id": video_id, "segment_seconds": 30}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let job_id = body["id"].as_str().unwrap().to_string();
    assert_eq!(body["status"], "pending");
    assert_eq!(body["params"]["segment_seconds"], 30);

    // Pending jobs cannot be retried.
    let (status, body) = app
        .post(&format!("/jobs/{job_id}/retry"), &json!({}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "JOB_NOT_RETRIABLE");

    let (status, body) = app
        .post(&format!("/jobs/{job_id}/cancel"), &json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");

    // Cancelling twice is rejected.
    let (status, body) = app
        .post(&format!("/jobs/{job_id}/cancel"), &json!({}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "JOB_NOT_CANCELLABLE");

    // A cancelled job can be retried back to pending with params intact.
    let (status, body) = app
        .post(&format!("/jobs/{job_id}/retry"), &json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["params"]["segment_seconds"], 30);
    assert!(body["started_at"].is_null());
}

#[tokio::test]
async fn test_sse_job_events_emit_on_change() {
    let app = test_app();
    let video_id = app.create_video();
    let job = app
        .ctx
        .store
        .create_job(&video_id, "index", &json!({}))
        .unwrap();

    // Terminal job: the first poll emits one `job` frame. Read only the
    // beginning of the stream, then drop it.
    app.ctx.store.cancel_job(&job.id).unwrap();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get(format!("/jobs/{}/events", job.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let first = tokio::time::timeout(std::time::Duration::from_secs(2), async {
        use futures::StreamExt;
        body.next().await
    })
    .await
    .unwrap()
    .unwrap()
    .unwrap();

    let text = String::from_utf8_lossy(&first);
    assert!(text.contains("event: job"));
    assert!(text.contains("id: "));
}

#[tokio::test]
async fn test_subtitles_and_transcript_endpoints() {
    let app = test_app();
    let video_id = app.create_video();
    app.write_transcript(&video_id);

    let (status, body) = app
        .get(&format!("/videos/{video_id}/transcript"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["segments"][0]["text"], "hello world");

    let response = app
        .router
        .clone()
        .oneshot(
            Request::get(format!("/videos/{video_id}/subtitles/srt"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&bytes).contains("hello world"));

    let (status, body) = app
        .get(&format!("/videos/{video_id}/subtitles/ass"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "UNSUPPORTED_SUBTITLE_FORMAT");
}

#[tokio::test]
async fn test_cloud_summary_requires_confirm_send() {
    let app = test_app();
    let (status, body) = app
        .post(
            "/summaries/cloud",
            &json!({"text": "some transcript text", "confirm_send": false}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "CONFIRM_SEND_REQUIRED");

    // confirm_send=true but the feature flag is off.
    let (status, body) = app
        .post(
            "/summaries/cloud",
            &json!({"text": "some transcript text", "confirm_send": true}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "CLOUD_SUMMARY_DISABLED");
}

#[tokio::test]
async fn test_runtime_profile_roundtrip_resizes_limiters() {
    let app = test_app();

    let (status, body) = app.get("/runtime/profile").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["effective"]["profile"], "balanced");

    let response = app
        .router
        .clone()
        .oneshot(
            Request::put("/runtime/profile")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::to_vec(&json!({"profile": "gpu", "llm_concurrency": 2})).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["effective"]["profile"], "gpu_recommended");
    assert_eq!(body["effective"]["asr_device"], "cuda");
    assert_eq!(app.ctx.runtime.llm.max_value(), 2);
}

#[tokio::test]
async fn test_llm_preferences_roundtrip() {
    let app = test_app();

    let (status, body) = app.get("/llm/preferences/default").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["preferences"]["provider"], "fake");

    let (status, body) = app.get("/llm/providers").await;
    assert_eq!(status, StatusCode::OK);
    let providers: Vec<&str> = body["providers"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert_eq!(providers, vec!["none", "fake", "openai_cloud", "openai_local"]);
}
