//! SQLite-backed vector store with named collections.
//!
//! Embeddings are stored as little-endian f32 blobs and compared with squared
//! L2 distance at query time. Collections are registered in their own table
//! so a lookup against a collection that was never created is a distinct,
//! non-error signal (`collection_missing`) rather than an empty result —
//! retrieval uses that to fall back from the versioned collection name to the
//! legacy flat one. The connection is process-wide and opened on first use;
//! open or IO failures surface as vector-store unavailability.

use crate::error::{Result, SiktError};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info};

/// Flat collection name used before embeddings were versioned.
pub const LEGACY_COLLECTION_NAME: &str = "video_chunks";

/// Lower-case, keep `[a-z0-9_-]`, squeeze the rest to `_`.
pub fn sanitize_collection_part(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_sub = false;
    for c in s.trim().to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
            out.push(c);
            last_was_sub = false;
        } else if !last_was_sub {
            out.push('_');
            last_was_sub = true;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Versioned collection name for a (model, dimension) pair.
pub fn chunks_collection_name(embed_model: &str, embed_dim: i64) -> String {
    format!(
        "video_chunks__{}__d{}",
        sanitize_collection_part(embed_model),
        embed_dim
    )
}

/// Result of a vector query; parallel arrays like the wire format of the
/// usual vector databases.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub ids: Vec<String>,
    pub documents: Vec<String>,
    pub metadatas: Vec<Value>,
    pub distances: Vec<f64>,
    pub collection_missing: bool,
}

impl QueryResult {
    fn missing() -> Self {
        Self {
            collection_missing: true,
            ..Default::default()
        }
    }
}

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap_or_default();
            f32::from_le_bytes(arr)
        })
        .collect()
}

fn squared_l2(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = f64::from(x - y);
            d * d
        })
        .sum()
}

/// Process-wide vector store handle; the database is opened lazily.
pub struct VectorDb {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl VectorDb {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: Mutex::new(None),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SiktError::VectorStore(format!("VECTOR_DB_OPEN_FAILED: {e}")))?;
            }
            let conn = Connection::open(&self.path)
                .map_err(|e| SiktError::VectorStore(format!("VECTOR_DB_OPEN_FAILED: {e}")))?;
            conn.execute_batch(
                r#"
                PRAGMA journal_mode=WAL;

                CREATE TABLE IF NOT EXISTS collections (
                    name TEXT PRIMARY KEY
                );

                CREATE TABLE IF NOT EXISTS vectors (
                    collection TEXT NOT NULL,
                    id TEXT NOT NULL,
                    video_id TEXT,
                    document TEXT NOT NULL,
                    embedding BLOB NOT NULL,
                    metadata_json TEXT,
                    PRIMARY KEY (collection, id)
                );

                CREATE INDEX IF NOT EXISTS idx_vectors_collection_video
                    ON vectors(collection, video_id);
                "#,
            )
            .map_err(|e| SiktError::VectorStore(format!("VECTOR_DB_INIT_FAILED: {e}")))?;
            info!("Initialized vector store at {:?}", self.path);
            *guard = Some(conn);
        }

        let Some(conn) = guard.as_ref() else {
            return Err(SiktError::VectorStore("VECTOR_DB_OPEN_FAILED".into()));
        };
        f(conn).map_err(|e| SiktError::VectorStore(format!("VECTOR_DB_QUERY_FAILED: {e}")))
    }

    fn collection_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM collections WHERE name=?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Upsert a batch of vectors into a collection, creating it if needed.
    pub fn upsert_vectors(
        &self,
        collection: &str,
        ids: &[String],
        documents: &[String],
        embeddings: &[Vec<f32>],
        metadatas: &[Value],
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO collections (name) VALUES (?1)",
                params![collection],
            )?;

            let tx = conn.unchecked_transaction()?;
            for i in 0..ids.len().min(documents.len()).min(embeddings.len()) {
                let metadata = metadatas.get(i);
                let video_id = metadata
                    .and_then(|m| m.get("video_id"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                tx.execute(
                    "INSERT OR REPLACE INTO vectors \
                     (collection, id, video_id, document, embedding, metadata_json) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        collection,
                        ids[i],
                        video_id,
                        documents[i],
                        embedding_to_bytes(&embeddings[i]),
                        metadata.map(|m| m.to_string()),
                    ],
                )?;
            }
            tx.commit()?;
            debug!("Upserted {} vectors into {}", ids.len(), collection);
            Ok(())
        })
    }

    /// Delete all vectors for a video from a collection. Creates the
    /// collection if absent, matching delete-by-filter semantics.
    pub fn delete_video_vectors(&self, collection: &str, video_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO collections (name) VALUES (?1)",
                params![collection],
            )?;
            conn.execute(
                "DELETE FROM vectors WHERE collection=?1 AND video_id=?2",
                params![collection, video_id],
            )?;
            Ok(())
        })
    }

    /// Nearest vectors for a query embedding within one video's rows.
    pub fn query_vectors(
        &self,
        collection: &str,
        query_embedding: &[f32],
        top_k: usize,
        video_id: &str,
        create_if_missing: bool,
    ) -> Result<QueryResult> {
        self.with_conn(|conn| {
            if !Self::collection_exists(conn, collection)? {
                if !create_if_missing {
                    return Ok(QueryResult::missing());
                }
                conn.execute(
                    "INSERT OR IGNORE INTO collections (name) VALUES (?1)",
                    params![collection],
                )?;
            }

            let mut stmt = conn.prepare(
                "SELECT id, document, embedding, metadata_json FROM vectors \
                 WHERE collection=?1 AND video_id=?2",
            )?;
            let mut scored: Vec<(String, String, Value, f64)> = stmt
                .query_map(params![collection, video_id], |row| {
                    let id: String = row.get(0)?;
                    let document: String = row.get(1)?;
                    let embedding_bytes: Vec<u8> = row.get(2)?;
                    let metadata_json: Option<String> = row.get(3)?;
                    Ok((id, document, embedding_bytes, metadata_json))
                })?
                .filter_map(|r| r.ok())
                .map(|(id, document, embedding_bytes, metadata_json)| {
                    let distance =
                        squared_l2(query_embedding, &bytes_to_embedding(&embedding_bytes));
                    let metadata = metadata_json
                        .and_then(|s| serde_json::from_str(&s).ok())
                        .unwrap_or(Value::Null);
                    (id, document, metadata, distance)
                })
                .collect();

            scored.sort_by(|a, b| a.3.partial_cmp(&b.3).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(top_k);

            let mut result = QueryResult::default();
            for (id, document, metadata, distance) in scored {
                result.ids.push(id);
                result.documents.push(document);
                result.metadatas.push(metadata);
                result.distances.push(distance);
            }
            Ok(result)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db() -> (tempfile::TempDir, VectorDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = VectorDb::new(dir.path().join("vectors.db"));
        (dir, db)
    }

    #[test]
    fn test_collection_name_sanitizer() {
        assert_eq!(
            chunks_collection_name("BAAI/bge-small-en-v1.5", 384),
            "video_chunks__baai_bge-small-en-v1_5__d384"
        );
        assert_eq!(chunks_collection_name("hash", 384), "video_chunks__hash__d384");
        assert_eq!(sanitize_collection_part("___"), "default");
        assert_eq!(sanitize_collection_part(""), "default");
    }

    #[test]
    fn test_query_missing_collection_is_a_signal() {
        let (_dir, db) = db();
        let res = db
            .query_vectors("video_chunks__hash__d4", &[0.0; 4], 5, "v1", false)
            .unwrap();
        assert!(res.collection_missing);
        assert!(res.ids.is_empty());
    }

    #[test]
    fn test_upsert_query_and_delete_by_video() {
        let (_dir, db) = db();
        let collection = "video_chunks__hash__d4";
        db.upsert_vectors(
            collection,
            &["v1:1".into(), "v1:2".into(), "v2:1".into()],
            &["near".into(), "far".into(), "other video".into()],
            &[
                vec![1.0, 0.0, 0.0, 0.0],
                vec![0.0, 1.0, 0.0, 0.0],
                vec![1.0, 0.0, 0.0, 0.0],
            ],
            &[
                json!({"video_id": "v1", "chunk_index": 1}),
                json!({"video_id": "v1", "chunk_index": 2}),
                json!({"video_id": "v2", "chunk_index": 1}),
            ],
        )
        .unwrap();

        let res = db
            .query_vectors(collection, &[1.0, 0.0, 0.0, 0.0], 5, "v1", false)
            .unwrap();
        assert!(!res.collection_missing);
        assert_eq!(res.ids, vec!["v1:1", "v1:2"]);
        assert_eq!(res.distances[0], 0.0);
        assert!(res.distances[1] > res.distances[0]);
        assert_eq!(res.metadatas[0]["chunk_index"], 1);

        db.delete_video_vectors(collection, "v1").unwrap();
        let res = db
            .query_vectors(collection, &[1.0, 0.0, 0.0, 0.0], 5, "v1", false)
            .unwrap();
        assert!(res.ids.is_empty());
        assert!(!res.collection_missing);
    }

    #[test]
    fn test_upsert_replaces_existing_id() {
        let (_dir, db) = db();
        let collection = LEGACY_COLLECTION_NAME;
        for text in ["first", "second"] {
            db.upsert_vectors(
                collection,
                &["v1:1".into()],
                &[text.into()],
                &[vec![0.5, 0.5]],
                &[json!({"video_id": "v1"})],
            )
            .unwrap();
        }
        let res = db
            .query_vectors(collection, &[0.5, 0.5], 5, "v1", false)
            .unwrap();
        assert_eq!(res.documents, vec!["second"]);
    }
}
