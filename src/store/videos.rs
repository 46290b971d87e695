//! Video rows.

use super::models::Video;
use super::{Paged, Store, NOW};
use crate::error::Result;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

impl Store {
    /// Deduplicate by file hash: return the existing row or insert a new one
    /// with status `pending`.
    pub fn create_or_get_video(
        &self,
        file_path: &str,
        file_hash: &str,
        duration: f64,
        file_size: i64,
    ) -> Result<Video> {
        let title = std::path::Path::new(file_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| file_path.to_string());

        self.with_conn(|conn| {
            let existing = conn
                .query_row(
                    "SELECT * FROM videos WHERE file_hash=?1",
                    params![file_hash],
                    Video::from_row,
                )
                .optional()?;
            if let Some(video) = existing {
                return Ok(video);
            }

            let video_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO videos (id, file_path, file_hash, title, duration, file_size, status) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending')",
                params![video_id, file_path, file_hash, title, duration, file_size],
            )?;
            Ok(conn.query_row(
                "SELECT * FROM videos WHERE id=?1",
                params![video_id],
                Video::from_row,
            )?)
        })
    }

    pub fn get_video(&self, video_id: &str) -> Result<Option<Video>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM videos WHERE id=?1",
                    params![video_id],
                    Video::from_row,
                )
                .optional()?)
        })
    }

    pub fn set_video_status(&self, video_id: &str, status: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!("UPDATE videos SET status=?1, updated_at={NOW} WHERE id=?2"),
                params![status, video_id],
            )?;
            Ok(())
        })
    }

    pub fn list_videos(
        &self,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Paged<Video>> {
        self.with_conn(|conn| {
            let (total, items) = match status {
                Some(status) => {
                    let total = conn.query_row(
                        "SELECT COUNT(1) FROM videos WHERE status=?1",
                        params![status],
                        |row| row.get(0),
                    )?;
                    let mut stmt = conn.prepare(
                        "SELECT * FROM videos WHERE status=?1 \
                         ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                    )?;
                    let items = stmt
                        .query_map(params![status, limit, offset], Video::from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    (total, items)
                }
                None => {
                    let total =
                        conn.query_row("SELECT COUNT(1) FROM videos", [], |row| row.get(0))?;
                    let mut stmt = conn.prepare(
                        "SELECT * FROM videos ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                    )?;
                    let items = stmt
                        .query_map(params![limit, offset], Video::from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    (total, items)
                }
            };
            Ok(Paged { total, items })
        })
    }

    /// Delete a video; dependent rows go with it via cascade.
    pub fn delete_video(&self, video_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn.execute("DELETE FROM videos WHERE id=?1", params![video_id])?;
            Ok(affected > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_or_get_dedups_by_hash() {
        let store = Store::in_memory().unwrap();
        let a = store
            .create_or_get_video("/tmp/movie.mp4", "h1", 12.5, 42)
            .unwrap();
        let b = store
            .create_or_get_video("/tmp/other-path.mp4", "h1", 99.0, 7)
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.duration, 12.5);
        assert_eq!(a.title, "movie.mp4");
        assert_eq!(a.status, "pending");
    }

    #[test]
    fn test_list_videos_filters_by_status() {
        let store = Store::in_memory().unwrap();
        let v = store.create_or_get_video("/tmp/a.mp4", "h1", 1.0, 1).unwrap();
        store.create_or_get_video("/tmp/b.mp4", "h2", 1.0, 1).unwrap();
        store.set_video_status(&v.id, "complete").unwrap();

        assert_eq!(store.list_videos(None, 50, 0).unwrap().total, 2);
        let complete = store.list_videos(Some("complete"), 50, 0).unwrap();
        assert_eq!(complete.total, 1);
        assert_eq!(complete.items[0].id, v.id);
    }
}
