//! Row types returned by the store.

use rusqlite::Row;
use serde::Serialize;
use serde_json::Value;

/// Parse a JSON text column, tolerating NULL and malformed content.
pub(crate) fn parse_json(raw: Option<String>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

/// Paged listing result.
#[derive(Debug, Clone, Serialize)]
pub struct Paged<T> {
    pub total: i64,
    pub items: Vec<T>,
}

/// An imported media file, unique by content hash.
#[derive(Debug, Clone, Serialize)]
pub struct Video {
    pub id: String,
    pub file_path: String,
    pub file_hash: String,
    pub title: String,
    pub duration: f64,
    pub file_size: i64,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Video {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            file_path: row.get("file_path")?,
            file_hash: row.get("file_hash")?,
            title: row.get("title")?,
            duration: row.get("duration")?,
            file_size: row.get("file_size")?,
            status: row.get("status")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// One queued or executed unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub video_id: String,
    pub job_type: String,
    pub status: String,
    pub progress: f64,
    pub message: String,
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl Job {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let params_json: Option<String> = row.get("params_json")?;
        let result_json: Option<String> = row.get("result_json")?;
        Ok(Self {
            id: row.get("id")?,
            video_id: row.get("video_id")?,
            job_type: row.get("job_type")?,
            status: row.get("status")?,
            progress: row.get("progress")?,
            message: row.get("message")?,
            params: parse_json(params_json).unwrap_or_else(|| Value::Object(Default::default())),
            result: parse_json(result_json),
            error_code: row.get("error_code")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// Per-video retrieval index record.
#[derive(Debug, Clone, Serialize)]
pub struct VideoIndex {
    pub video_id: String,
    pub status: String,
    pub progress: f64,
    pub message: String,
    pub embed_model: Option<String>,
    pub embed_dim: Option<i64>,
    pub chunk_params: Option<Value>,
    pub transcript_hash: Option<String>,
    pub chunk_count: i64,
    pub indexed_count: i64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl VideoIndex {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let chunk_params_json: Option<String> = row.get("chunk_params_json")?;
        Ok(Self {
            video_id: row.get("video_id")?,
            status: row.get("status")?,
            progress: row.get("progress")?,
            message: row.get("message")?,
            embed_model: row.get("embed_model")?,
            embed_dim: row.get("embed_dim")?,
            chunk_params: parse_json(chunk_params_json),
            transcript_hash: row.get("transcript_hash")?,
            chunk_count: row.get("chunk_count")?,
            indexed_count: row.get("indexed_count")?,
            error_code: row.get("error_code")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Per-video hierarchical summary record.
#[derive(Debug, Clone, Serialize)]
pub struct VideoSummary {
    pub video_id: String,
    pub status: String,
    pub progress: f64,
    pub message: String,
    pub transcript_hash: Option<String>,
    pub params: Option<Value>,
    pub segment_summaries: Option<Value>,
    pub summary_markdown: Option<String>,
    pub outline_json: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl VideoSummary {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let params_json: Option<String> = row.get("params_json")?;
        let segment_summaries_json: Option<String> = row.get("segment_summaries_json")?;
        Ok(Self {
            video_id: row.get("video_id")?,
            status: row.get("status")?,
            progress: row.get("progress")?,
            message: row.get("message")?,
            transcript_hash: row.get("transcript_hash")?,
            params: parse_json(params_json),
            segment_summaries: parse_json(segment_summaries_json),
            summary_markdown: row.get("summary_markdown")?,
            outline_json: row.get("outline_json")?,
            error_code: row.get("error_code")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Per-video keyframe extraction record. Freshness is decided by normalized
/// parameter equality, not transcript hash.
#[derive(Debug, Clone, Serialize)]
pub struct VideoKeyframeIndex {
    pub video_id: String,
    pub status: String,
    pub progress: f64,
    pub message: String,
    pub params: Option<Value>,
    pub frame_count: i64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl VideoKeyframeIndex {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let params_json: Option<String> = row.get("params_json")?;
        Ok(Self {
            video_id: row.get("video_id")?,
            status: row.get("status")?,
            progress: row.get("progress")?,
            message: row.get("message")?,
            params: parse_json(params_json),
            frame_count: row.get("frame_count")?,
            error_code: row.get("error_code")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// One extracted keyframe image.
#[derive(Debug, Clone, Serialize)]
pub struct Keyframe {
    pub id: String,
    pub video_id: String,
    pub timestamp_ms: i64,
    pub image_relpath: String,
    pub method: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub score: Option<f64>,
    pub metadata: Option<Value>,
    pub created_at: String,
}

impl Keyframe {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let metadata_json: Option<String> = row.get("metadata_json")?;
        Ok(Self {
            id: row.get("id")?,
            video_id: row.get("video_id")?,
            timestamp_ms: row.get("timestamp_ms")?,
            image_relpath: row.get("image_relpath")?,
            method: row.get("method")?,
            width: row.get("width")?,
            height: row.get("height")?,
            score: row.get("score")?,
            metadata: parse_json(metadata_json),
            created_at: row.get("created_at")?,
        })
    }
}

/// One indexed transcript chunk, keyed `video_id:index`.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub id: String,
    pub video_id: String,
    pub chunk_index: i64,
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
    pub content_hash: String,
    pub created_at: String,
}

impl Chunk {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            video_id: row.get("video_id")?,
            chunk_index: row.get("chunk_index")?,
            start_time: row.get("start_time")?,
            end_time: row.get("end_time")?,
            text: row.get("text")?,
            content_hash: row.get("content_hash")?,
            created_at: row.get("created_at")?,
        })
    }
}
