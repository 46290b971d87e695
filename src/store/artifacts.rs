//! Per-artifact index records: retrieval index, summary, keyframe index.
//!
//! Each is a single row per video, replaced wholesale by the owning pipeline
//! (`upsert_*`) and patched by the worker's cancellation/failure paths
//! (`update_*`). Every write advances `updated_at`.

use super::models::{VideoIndex, VideoKeyframeIndex, VideoSummary};
use super::{Store, NOW};
use crate::error::Result;
use rusqlite::{params, OptionalExtension};

/// Full retrieval-index row state.
#[derive(Debug, Default, Clone)]
pub struct IndexState {
    pub status: String,
    pub progress: f64,
    pub message: String,
    pub embed_model: Option<String>,
    pub embed_dim: Option<i64>,
    pub chunk_params_json: Option<String>,
    pub transcript_hash: Option<String>,
    pub chunk_count: i64,
    pub indexed_count: i64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Full summary row state.
#[derive(Debug, Default, Clone)]
pub struct SummaryState {
    pub status: String,
    pub progress: f64,
    pub message: String,
    pub transcript_hash: Option<String>,
    pub params_json: Option<String>,
    pub segment_summaries_json: Option<String>,
    pub summary_markdown: Option<String>,
    pub outline_json: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Partial summary update used while the map phase streams results in.
#[derive(Debug, Default, Clone)]
pub struct SummaryUpdate {
    pub status: Option<String>,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub transcript_hash: Option<String>,
    pub params_json: Option<String>,
    pub segment_summaries_json: Option<String>,
    pub summary_markdown: Option<String>,
    pub outline_json: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Full keyframe-index row state.
#[derive(Debug, Default, Clone)]
pub struct KeyframeIndexState {
    pub status: String,
    pub progress: f64,
    pub message: String,
    pub params_json: Option<String>,
    pub frame_count: i64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Which per-artifact table a status patch targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Index,
    Summary,
    KeyframeIndex,
}

impl ArtifactKind {
    fn table(self) -> &'static str {
        match self {
            ArtifactKind::Index => "video_indexes",
            ArtifactKind::Summary => "video_summaries",
            ArtifactKind::KeyframeIndex => "video_keyframe_indexes",
        }
    }
}

impl Store {
    pub fn upsert_video_index(&self, video_id: &str, state: &IndexState) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO video_indexes (video_id, status, progress, message, \
                     embed_model, embed_dim, chunk_params_json, transcript_hash, \
                     chunk_count, indexed_count, error_code, error_message) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                     ON CONFLICT(video_id) DO UPDATE SET \
                     status=excluded.status, progress=excluded.progress, \
                     message=excluded.message, embed_model=excluded.embed_model, \
                     embed_dim=excluded.embed_dim, \
                     chunk_params_json=excluded.chunk_params_json, \
                     transcript_hash=excluded.transcript_hash, \
                     chunk_count=excluded.chunk_count, \
                     indexed_count=excluded.indexed_count, \
                     error_code=excluded.error_code, \
                     error_message=excluded.error_message, \
                     updated_at={NOW}"
                ),
                params![
                    video_id,
                    state.status,
                    state.progress,
                    state.message,
                    state.embed_model,
                    state.embed_dim,
                    state.chunk_params_json,
                    state.transcript_hash,
                    state.chunk_count,
                    state.indexed_count,
                    state.error_code,
                    state.error_message,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_video_index(&self, video_id: &str) -> Result<Option<VideoIndex>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM video_indexes WHERE video_id=?1",
                    params![video_id],
                    VideoIndex::from_row,
                )
                .optional()?)
        })
    }

    pub fn delete_video_index(&self, video_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM video_indexes WHERE video_id=?1",
                params![video_id],
            )?;
            Ok(())
        })
    }

    pub fn upsert_video_summary(&self, video_id: &str, state: &SummaryState) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO video_summaries (video_id, status, progress, message, \
                     transcript_hash, params_json, segment_summaries_json, \
                     summary_markdown, outline_json, error_code, error_message) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                     ON CONFLICT(video_id) DO UPDATE SET \
                     status=excluded.status, progress=excluded.progress, \
                     message=excluded.message, \
                     transcript_hash=excluded.transcript_hash, \
                     params_json=excluded.params_json, \
                     segment_summaries_json=excluded.segment_summaries_json, \
                     summary_markdown=excluded.summary_markdown, \
                     outline_json=excluded.outline_json, \
                     error_code=excluded.error_code, \
                     error_message=excluded.error_message, \
                     updated_at={NOW}"
                ),
                params![
                    video_id,
                    state.status,
                    state.progress,
                    state.message,
                    state.transcript_hash,
                    state.params_json,
                    state.segment_summaries_json,
                    state.summary_markdown,
                    state.outline_json,
                    state.error_code,
                    state.error_message,
                ],
            )?;
            Ok(())
        })
    }

    pub fn update_video_summary(&self, video_id: &str, update: &SummaryUpdate) -> Result<()> {
        let mut fields: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        let push = |column: &str,
                    value: Box<dyn rusqlite::ToSql>,
                    values: &mut Vec<Box<dyn rusqlite::ToSql>>,
                    fields: &mut Vec<String>| {
            fields.push(format!("{column}=?{}", values.len() + 1));
            values.push(value);
        };

        if let Some(v) = &update.status {
            push("status", Box::new(v.clone()), &mut values, &mut fields);
        }
        if let Some(v) = update.progress {
            push("progress", Box::new(v), &mut values, &mut fields);
        }
        if let Some(v) = &update.message {
            push("message", Box::new(v.clone()), &mut values, &mut fields);
        }
        if let Some(v) = &update.transcript_hash {
            push("transcript_hash", Box::new(v.clone()), &mut values, &mut fields);
        }
        if let Some(v) = &update.params_json {
            push("params_json", Box::new(v.clone()), &mut values, &mut fields);
        }
        if let Some(v) = &update.segment_summaries_json {
            push("segment_summaries_json", Box::new(v.clone()), &mut values, &mut fields);
        }
        if let Some(v) = &update.summary_markdown {
            push("summary_markdown", Box::new(v.clone()), &mut values, &mut fields);
        }
        if let Some(v) = &update.outline_json {
            push("outline_json", Box::new(v.clone()), &mut values, &mut fields);
        }
        if let Some(v) = &update.error_code {
            push("error_code", Box::new(v.clone()), &mut values, &mut fields);
        }
        if let Some(v) = &update.error_message {
            push("error_message", Box::new(v.clone()), &mut values, &mut fields);
        }

        if fields.is_empty() {
            return Ok(());
        }
        fields.push(format!("updated_at={NOW}"));

        let sql = format!(
            "UPDATE video_summaries SET {} WHERE video_id=?{}",
            fields.join(", "),
            values.len() + 1
        );
        values.push(Box::new(video_id.to_string()));

        self.with_conn(|conn| {
            conn.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
            Ok(())
        })
    }

    pub fn get_video_summary(&self, video_id: &str) -> Result<Option<VideoSummary>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM video_summaries WHERE video_id=?1",
                    params![video_id],
                    VideoSummary::from_row,
                )
                .optional()?)
        })
    }

    pub fn delete_video_summary(&self, video_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM video_summaries WHERE video_id=?1",
                params![video_id],
            )?;
            Ok(())
        })
    }

    pub fn upsert_video_keyframe_index(
        &self,
        video_id: &str,
        state: &KeyframeIndexState,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO video_keyframe_indexes (video_id, status, progress, \
                     message, params_json, frame_count, error_code, error_message) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                     ON CONFLICT(video_id) DO UPDATE SET \
                     status=excluded.status, progress=excluded.progress, \
                     message=excluded.message, params_json=excluded.params_json, \
                     frame_count=excluded.frame_count, \
                     error_code=excluded.error_code, \
                     error_message=excluded.error_message, \
                     updated_at={NOW}"
                ),
                params![
                    video_id,
                    state.status,
                    state.progress,
                    state.message,
                    state.params_json,
                    state.frame_count,
                    state.error_code,
                    state.error_message,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_video_keyframe_index(&self, video_id: &str) -> Result<Option<VideoKeyframeIndex>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM video_keyframe_indexes WHERE video_id=?1",
                    params![video_id],
                    VideoKeyframeIndex::from_row,
                )
                .optional()?)
        })
    }

    pub fn delete_video_keyframe_index(&self, video_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM video_keyframe_indexes WHERE video_id=?1",
                params![video_id],
            )?;
            Ok(())
        })
    }

    /// Patch status/progress/message/error on one of the per-artifact rows.
    /// Missing rows are left alone, mirroring the upsert-owns-creation rule.
    #[allow(clippy::too_many_arguments)]
    pub fn update_artifact_status(
        &self,
        kind: ArtifactKind,
        video_id: &str,
        status: &str,
        progress: Option<f64>,
        message: &str,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut fields = vec!["status=?1".to_string(), "message=?2".to_string()];
        let mut values: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(status.to_string()), Box::new(message.to_string())];

        if let Some(progress) = progress {
            fields.push(format!("progress=?{}", values.len() + 1));
            values.push(Box::new(progress));
        }
        if let Some(error_code) = error_code {
            fields.push(format!("error_code=?{}", values.len() + 1));
            values.push(Box::new(error_code.to_string()));
        }
        if let Some(error_message) = error_message {
            fields.push(format!("error_message=?{}", values.len() + 1));
            values.push(Box::new(error_message.to_string()));
        }
        fields.push(format!("updated_at={NOW}"));

        let sql = format!(
            "UPDATE {} SET {} WHERE video_id=?{}",
            kind.table(),
            fields.join(", "),
            values.len() + 1
        );
        values.push(Box::new(video_id.to_string()));

        self.with_conn(|conn| {
            conn.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_video() -> (Store, String) {
        let store = Store::in_memory().unwrap();
        let video = store
            .create_or_get_video("/tmp/a.mp4", "h1", 10.0, 100)
            .unwrap();
        (store, video.id)
    }

    #[test]
    fn test_index_upsert_replaces_row() {
        let (store, video_id) = store_with_video();
        store
            .upsert_video_index(
                &video_id,
                &IndexState {
                    status: "running".into(),
                    message: "chunking".into(),
                    embed_model: Some("hash".into()),
                    embed_dim: Some(384),
                    transcript_hash: Some("t1".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        store
            .upsert_video_index(
                &video_id,
                &IndexState {
                    status: "completed".into(),
                    progress: 1.0,
                    message: "completed".into(),
                    embed_model: Some("hash".into()),
                    embed_dim: Some(384),
                    transcript_hash: Some("t1".into()),
                    chunk_count: 4,
                    indexed_count: 4,
                    ..Default::default()
                },
            )
            .unwrap();

        let row = store.get_video_index(&video_id).unwrap().unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.chunk_count, 4);
        assert_eq!(row.indexed_count, 4);
        assert_eq!(row.transcript_hash.as_deref(), Some("t1"));
    }

    #[test]
    fn test_summary_partial_update() {
        let (store, video_id) = store_with_video();
        store
            .upsert_video_summary(
                &video_id,
                &SummaryState {
                    status: "running".into(),
                    message: "starting".into(),
                    transcript_hash: Some("t1".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        store
            .update_video_summary(
                &video_id,
                &SummaryUpdate {
                    progress: Some(0.5),
                    message: Some("summarizing".into()),
                    segment_summaries_json: Some("[{\"summary\":\"x\"}]".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let row = store.get_video_summary(&video_id).unwrap().unwrap();
        assert_eq!(row.status, "running");
        assert_eq!(row.progress, 0.5);
        assert!(row.segment_summaries.is_some());
        assert_eq!(row.transcript_hash.as_deref(), Some("t1"));
    }

    #[test]
    fn test_artifact_status_patch() {
        let (store, video_id) = store_with_video();
        store
            .upsert_video_keyframe_index(
                &video_id,
                &KeyframeIndexState {
                    status: "running".into(),
                    message: "starting".into(),
                    ..Default::default()
                },
            )
            .unwrap();

        store
            .update_artifact_status(
                ArtifactKind::KeyframeIndex,
                &video_id,
                "cancelled",
                None,
                "cancelled",
                None,
                None,
            )
            .unwrap();

        let row = store.get_video_keyframe_index(&video_id).unwrap().unwrap();
        assert_eq!(row.status, "cancelled");
        assert_eq!(row.message, "cancelled");
    }
}
