//! Chunk rows written by the index pipeline.

use super::models::Chunk;
use super::{Paged, Store};
use crate::error::Result;
use rusqlite::params;

impl Store {
    /// Insert or replace one chunk row. `chunk_id` is `video_id:index`.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_chunk(
        &self,
        chunk_id: &str,
        video_id: &str,
        chunk_index: i64,
        start_time: f64,
        end_time: f64,
        text: &str,
        content_hash: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO chunks \
                 (id, video_id, chunk_index, start_time, end_time, text, content_hash) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    chunk_id,
                    video_id,
                    chunk_index,
                    start_time,
                    end_time,
                    text,
                    content_hash
                ],
            )?;
            Ok(())
        })
    }

    pub fn list_chunks(&self, video_id: &str, limit: i64, offset: i64) -> Result<Paged<Chunk>> {
        let limit = limit.clamp(1, 200);
        let offset = offset.max(0);
        self.with_conn(|conn| {
            let total = conn.query_row(
                "SELECT COUNT(1) FROM chunks WHERE video_id=?1",
                params![video_id],
                |row| row.get(0),
            )?;
            let mut stmt = conn.prepare(
                "SELECT * FROM chunks WHERE video_id=?1 \
                 ORDER BY chunk_index ASC LIMIT ?2 OFFSET ?3",
            )?;
            let items = stmt
                .query_map(params![video_id, limit, offset], Chunk::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(Paged { total, items })
        })
    }

    pub fn delete_chunks_for_video(&self, video_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM chunks WHERE video_id=?1", params![video_id])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::sha256_text;

    #[test]
    fn test_chunks_are_dense_and_ordered() {
        let store = Store::in_memory().unwrap();
        let video = store
            .create_or_get_video("/tmp/a.mp4", "h1", 10.0, 100)
            .unwrap();

        for (i, text) in ["alpha", "beta", "gamma"].iter().enumerate() {
            let idx = (i + 1) as i64;
            store
                .insert_chunk(
                    &format!("{}:{}", video.id, idx),
                    &video.id,
                    idx,
                    i as f64,
                    (i + 1) as f64,
                    text,
                    &sha256_text(text),
                )
                .unwrap();
        }

        let page = store.list_chunks(&video.id, 50, 0).unwrap();
        assert_eq!(page.total, 3);
        let indexes: Vec<i64> = page.items.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);
        for chunk in &page.items {
            assert!(chunk.start_time < chunk.end_time);
            assert_eq!(chunk.content_hash, sha256_text(&chunk.text));
        }

        store.delete_chunks_for_video(&video.id).unwrap();
        assert_eq!(store.list_chunks(&video.id, 50, 0).unwrap().total, 0);
    }
}
