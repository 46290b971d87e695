//! Keyframe rows.

use super::models::Keyframe;
use super::{Paged, Store};
use crate::error::Result;
use rusqlite::{params, OptionalExtension};

impl Store {
    #[allow(clippy::too_many_arguments)]
    pub fn insert_video_keyframe(
        &self,
        id: &str,
        video_id: &str,
        timestamp_ms: i64,
        image_relpath: &str,
        method: &str,
        width: Option<i64>,
        height: Option<i64>,
        score: Option<f64>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO video_keyframes \
                 (id, video_id, timestamp_ms, image_relpath, method, width, height, score) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![id, video_id, timestamp_ms, image_relpath, method, width, height, score],
            )?;
            Ok(())
        })
    }

    pub fn get_video_keyframe(&self, keyframe_id: &str) -> Result<Option<Keyframe>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM video_keyframes WHERE id=?1",
                    params![keyframe_id],
                    Keyframe::from_row,
                )
                .optional()?)
        })
    }

    /// Closest keyframe by `timestamp_ms`, preferring the earlier frame on a
    /// tie. Probes one row on each side of the timestamp.
    pub fn get_nearest_video_keyframe(
        &self,
        video_id: &str,
        timestamp_ms: i64,
        method: Option<&str>,
    ) -> Result<Option<Keyframe>> {
        self.with_conn(|conn| {
            let (row_before, row_after) = match method {
                Some(method) => {
                    let before = conn
                        .query_row(
                            "SELECT * FROM video_keyframes WHERE video_id=?1 AND method=?2 \
                             AND timestamp_ms<=?3 ORDER BY timestamp_ms DESC LIMIT 1",
                            params![video_id, method, timestamp_ms],
                            Keyframe::from_row,
                        )
                        .optional()?;
                    let after = conn
                        .query_row(
                            "SELECT * FROM video_keyframes WHERE video_id=?1 AND method=?2 \
                             AND timestamp_ms>=?3 ORDER BY timestamp_ms ASC LIMIT 1",
                            params![video_id, method, timestamp_ms],
                            Keyframe::from_row,
                        )
                        .optional()?;
                    (before, after)
                }
                None => {
                    let before = conn
                        .query_row(
                            "SELECT * FROM video_keyframes WHERE video_id=?1 \
                             AND timestamp_ms<=?2 ORDER BY timestamp_ms DESC LIMIT 1",
                            params![video_id, timestamp_ms],
                            Keyframe::from_row,
                        )
                        .optional()?;
                    let after = conn
                        .query_row(
                            "SELECT * FROM video_keyframes WHERE video_id=?1 \
                             AND timestamp_ms>=?2 ORDER BY timestamp_ms ASC LIMIT 1",
                            params![video_id, timestamp_ms],
                            Keyframe::from_row,
                        )
                        .optional()?;
                    (before, after)
                }
            };

            Ok(match (row_before, row_after) {
                (Some(a), Some(b)) => {
                    let da = (a.timestamp_ms - timestamp_ms).abs();
                    let db = (b.timestamp_ms - timestamp_ms).abs();
                    Some(if da <= db { a } else { b })
                }
                (a, b) => a.or(b),
            })
        })
    }

    /// Keyframes for a video in ascending timestamp order.
    pub fn list_video_keyframes(
        &self,
        video_id: &str,
        method: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Paged<Keyframe>> {
        let limit = limit.clamp(1, 500);
        let offset = offset.max(0);
        self.with_conn(|conn| {
            let (total, items) = match method {
                Some(method) => {
                    let total = conn.query_row(
                        "SELECT COUNT(1) FROM video_keyframes WHERE video_id=?1 AND method=?2",
                        params![video_id, method],
                        |row| row.get(0),
                    )?;
                    let mut stmt = conn.prepare(
                        "SELECT * FROM video_keyframes WHERE video_id=?1 AND method=?2 \
                         ORDER BY timestamp_ms ASC LIMIT ?3 OFFSET ?4",
                    )?;
                    let items = stmt
                        .query_map(params![video_id, method, limit, offset], Keyframe::from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    (total, items)
                }
                None => {
                    let total = conn.query_row(
                        "SELECT COUNT(1) FROM video_keyframes WHERE video_id=?1",
                        params![video_id],
                        |row| row.get(0),
                    )?;
                    let mut stmt = conn.prepare(
                        "SELECT * FROM video_keyframes WHERE video_id=?1 \
                         ORDER BY timestamp_ms ASC LIMIT ?2 OFFSET ?3",
                    )?;
                    let items = stmt
                        .query_map(params![video_id, limit, offset], Keyframe::from_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    (total, items)
                }
            };
            Ok(Paged { total, items })
        })
    }

    pub fn delete_video_keyframes_for_video(&self, video_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM video_keyframes WHERE video_id=?1",
                params![video_id],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(store: &Store, video_id: &str) {
        for (i, ts) in [0i64, 5000, 10000].iter().enumerate() {
            store
                .insert_video_keyframe(
                    &format!("k{i}"),
                    video_id,
                    *ts,
                    &format!("storage/keyframes/{video_id}/k{i}.jpg"),
                    "interval",
                    Some(320),
                    Some(240),
                    None,
                )
                .unwrap();
        }
    }

    #[test]
    fn test_list_orders_by_timestamp() {
        let store = Store::in_memory().unwrap();
        let video = store
            .create_or_get_video("/tmp/a.mp4", "h1", 10.0, 100)
            .unwrap();
        // Insert out of order; listing must sort ascending.
        store
            .insert_video_keyframe("late", &video.id, 9000, "x", "interval", None, None, None)
            .unwrap();
        store
            .insert_video_keyframe("early", &video.id, 1000, "x", "interval", None, None, None)
            .unwrap();

        let page = store.list_video_keyframes(&video.id, None, 50, 0).unwrap();
        let ts: Vec<i64> = page.items.iter().map(|k| k.timestamp_ms).collect();
        assert_eq!(ts, vec![1000, 9000]);
    }

    #[test]
    fn test_nearest_prefers_closer_row() {
        let store = Store::in_memory().unwrap();
        let video = store
            .create_or_get_video("/tmp/a.mp4", "h1", 10.0, 100)
            .unwrap();
        seed(&store, &video.id);

        let nearest = store
            .get_nearest_video_keyframe(&video.id, 6000, Some("interval"))
            .unwrap()
            .unwrap();
        assert_eq!(nearest.timestamp_ms, 5000);

        let nearest = store
            .get_nearest_video_keyframe(&video.id, 8000, Some("interval"))
            .unwrap()
            .unwrap();
        assert_eq!(nearest.timestamp_ms, 10000);

        // Tie goes to the earlier frame.
        let nearest = store
            .get_nearest_video_keyframe(&video.id, 7500, Some("interval"))
            .unwrap()
            .unwrap();
        assert_eq!(nearest.timestamp_ms, 5000);

        assert!(store
            .get_nearest_video_keyframe(&video.id, 0, Some("scene"))
            .unwrap()
            .is_none());
    }
}
