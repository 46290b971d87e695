//! Durable SQLite store.
//!
//! Owns every relational row: videos, jobs, per-artifact index records,
//! keyframes, chunks, and the two preference singletons. WAL journaling,
//! foreign-key cascades from `videos`, and sub-second `updated_at` stamps so
//! streaming clients can detect any mutation. Schema upgrades are additive:
//! missing columns are added on open with defaults backfilled from siblings.

mod artifacts;
mod chunks;
mod jobs;
mod keyframes;
mod models;
mod prefs;
mod videos;

pub use artifacts::{ArtifactKind, IndexState, KeyframeIndexState, SummaryState, SummaryUpdate};
pub use jobs::JobUpdate;
pub use models::{Chunk, Job, Keyframe, Paged, Video, VideoIndex, VideoKeyframeIndex, VideoSummary};

use crate::error::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

/// SQL expression producing a sub-second UTC timestamp.
pub(crate) const NOW: &str = "strftime('%Y-%m-%d %H:%M:%f','now')";

/// Handle over the durable database. All mutations are short transactions on
/// a single connection guarded by a mutex.
pub struct Store {
    pub(crate) conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self::initialize(conn)?;
        info!("Opened durable store at {:?}", path);
        Ok(store)
    }

    /// In-memory database, used by tests.
    pub fn in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&conn)
    }
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn migrate(conn: &Connection) -> Result<()> {
    if !has_column(conn, "jobs", "updated_at")? {
        conn.execute("ALTER TABLE jobs ADD COLUMN updated_at TEXT", [])?;
        conn.execute(
            "UPDATE jobs SET updated_at=created_at WHERE updated_at IS NULL",
            [],
        )?;
    }
    Ok(())
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS videos (
    id TEXT PRIMARY KEY,
    file_path TEXT NOT NULL,
    file_hash TEXT UNIQUE NOT NULL,
    title TEXT NOT NULL,
    duration REAL NOT NULL,
    file_size INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT DEFAULT (strftime('%Y-%m-%d %H:%M:%f','now')),
    updated_at TEXT DEFAULT (strftime('%Y-%m-%d %H:%M:%f','now'))
);

CREATE INDEX IF NOT EXISTS idx_videos_hash ON videos(file_hash);
CREATE INDEX IF NOT EXISTS idx_videos_status ON videos(status);

CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    video_id TEXT NOT NULL,
    job_type TEXT NOT NULL,
    status TEXT NOT NULL,
    progress REAL DEFAULT 0,
    message TEXT DEFAULT '',
    params_json TEXT,
    result_json TEXT,
    error_code TEXT,
    error_message TEXT,
    created_at TEXT DEFAULT (strftime('%Y-%m-%d %H:%M:%f','now')),
    updated_at TEXT DEFAULT (strftime('%Y-%m-%d %H:%M:%f','now')),
    started_at TEXT,
    completed_at TEXT,
    FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_jobs_video ON jobs(video_id);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_updated ON jobs(updated_at);
CREATE INDEX IF NOT EXISTS idx_jobs_video_type_status ON jobs(video_id, job_type, status);

CREATE TABLE IF NOT EXISTS video_indexes (
    video_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    progress REAL DEFAULT 0,
    message TEXT DEFAULT '',
    embed_model TEXT,
    embed_dim INTEGER,
    chunk_params_json TEXT,
    transcript_hash TEXT,
    chunk_count INTEGER DEFAULT 0,
    indexed_count INTEGER DEFAULT 0,
    error_code TEXT,
    error_message TEXT,
    created_at TEXT DEFAULT (strftime('%Y-%m-%d %H:%M:%f','now')),
    updated_at TEXT DEFAULT (strftime('%Y-%m-%d %H:%M:%f','now')),
    FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_video_indexes_status ON video_indexes(status);

CREATE TABLE IF NOT EXISTS video_summaries (
    video_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    progress REAL DEFAULT 0,
    message TEXT DEFAULT '',
    transcript_hash TEXT,
    params_json TEXT,
    segment_summaries_json TEXT,
    summary_markdown TEXT,
    outline_json TEXT,
    error_code TEXT,
    error_message TEXT,
    created_at TEXT DEFAULT (strftime('%Y-%m-%d %H:%M:%f','now')),
    updated_at TEXT DEFAULT (strftime('%Y-%m-%d %H:%M:%f','now')),
    FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_video_summaries_status ON video_summaries(status);

CREATE TABLE IF NOT EXISTS video_keyframe_indexes (
    video_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    progress REAL DEFAULT 0,
    message TEXT DEFAULT '',
    params_json TEXT,
    frame_count INTEGER DEFAULT 0,
    error_code TEXT,
    error_message TEXT,
    created_at TEXT DEFAULT (strftime('%Y-%m-%d %H:%M:%f','now')),
    updated_at TEXT DEFAULT (strftime('%Y-%m-%d %H:%M:%f','now')),
    FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_video_keyframe_indexes_status
    ON video_keyframe_indexes(status);

CREATE TABLE IF NOT EXISTS video_keyframes (
    id TEXT PRIMARY KEY,
    video_id TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    image_relpath TEXT NOT NULL,
    method TEXT NOT NULL,
    width INTEGER,
    height INTEGER,
    score REAL,
    metadata_json TEXT,
    created_at TEXT DEFAULT (strftime('%Y-%m-%d %H:%M:%f','now')),
    FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_video_keyframes_video_time
    ON video_keyframes(video_id, timestamp_ms);

CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    video_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    start_time REAL NOT NULL,
    end_time REAL NOT NULL,
    text TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    created_at TEXT DEFAULT (strftime('%Y-%m-%d %H:%M:%f','now')),
    FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE,
    UNIQUE (video_id, chunk_index)
);

CREATE INDEX IF NOT EXISTS idx_chunks_video ON chunks(video_id);
CREATE INDEX IF NOT EXISTS idx_chunks_hash ON chunks(content_hash);
CREATE INDEX IF NOT EXISTS idx_chunks_time ON chunks(video_id, chunk_index);

CREATE TABLE IF NOT EXISTS llm_preferences (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    prefs_json TEXT NOT NULL,
    updated_at TEXT DEFAULT (strftime('%Y-%m-%d %H:%M:%f','now'))
);

INSERT OR IGNORE INTO llm_preferences (id, prefs_json)
    VALUES (1, '{"provider":"fake","temperature":0.2,"max_tokens":512}');

CREATE TABLE IF NOT EXISTS runtime_preferences (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    prefs_json TEXT NOT NULL,
    updated_at TEXT DEFAULT (strftime('%Y-%m-%d %H:%M:%f','now'))
);

INSERT OR IGNORE INTO runtime_preferences (id, prefs_json)
    VALUES (1, '{"profile":"balanced"}');
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_seeds_preference_singletons() {
        let store = Store::in_memory().unwrap();
        let prefs = store.get_default_llm_preferences().unwrap();
        assert_eq!(prefs["provider"], "fake");

        let runtime = store.get_default_runtime_preferences().unwrap();
        assert_eq!(runtime.profile.as_deref(), Some("balanced"));
    }

    #[test]
    fn test_video_cascade_deletes_dependents() {
        let store = Store::in_memory().unwrap();
        let video = store
            .create_or_get_video("/tmp/a.mp4", "hash-a", 10.0, 100)
            .unwrap();
        store
            .create_job(&video.id, "transcribe", &serde_json::json!({}))
            .unwrap();
        store.delete_video(&video.id).unwrap();

        let jobs = store
            .list_jobs(None, Some(video.id.as_str()), None, 10, 0)
            .unwrap();
        assert_eq!(jobs.total, 0);
    }
}
