//! Job rows and queue state transitions.
//!
//! `claim_pending_job` is the atomic pending→running handoff: a conditional
//! update that also stamps `started_at`, the epoch token pipelines use to
//! detect cancel/retry races.

use super::models::Job;
use super::{Paged, Store, NOW};
use crate::error::Result;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

/// Partial update for a job row; only set fields are written, and
/// `updated_at` always advances.
#[derive(Debug, Default, Clone)]
pub struct JobUpdate {
    pub status: Option<String>,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub result: Option<Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl JobUpdate {
    pub fn progress(progress: f64, message: impl Into<String>) -> Self {
        Self {
            progress: Some(progress),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

impl Store {
    pub fn create_job(&self, video_id: &str, job_type: &str, params: &Value) -> Result<Job> {
        let job_id = Uuid::new_v4().to_string();
        let params_json = serde_json::to_string(params)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO jobs (id, video_id, job_type, status, progress, message, params_json) \
                 VALUES (?1, ?2, ?3, 'pending', 0, '', ?4)",
                params![job_id, video_id, job_type, params_json],
            )?;
            Ok(conn.query_row(
                "SELECT * FROM jobs WHERE id=?1",
                params![job_id],
                Job::from_row,
            )?)
        })
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT * FROM jobs WHERE id=?1", params![job_id], Job::from_row)
                .optional()?)
        })
    }

    /// Cheap status probe used by pipelines to notice external cancellation.
    pub fn get_job_status(&self, job_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT status FROM jobs WHERE id=?1",
                    params![job_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Oldest pending job, FIFO by `created_at`.
    pub fn fetch_next_pending_job(&self) -> Result<Option<Job>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM jobs WHERE status='pending' ORDER BY created_at LIMIT 1",
                    [],
                    Job::from_row,
                )
                .optional()?)
        })
    }

    /// Conditional pending→running transition; returns whether this caller
    /// won the claim.
    pub fn claim_pending_job(&self, job_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                &format!(
                    "UPDATE jobs SET status='running', started_at={NOW}, updated_at={NOW} \
                     WHERE id=?1 AND status='pending'"
                ),
                params![job_id],
            )?;
            Ok(affected == 1)
        })
    }

    /// Cancel a pending or running job.
    pub fn cancel_job(&self, job_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                &format!(
                    "UPDATE jobs SET status='cancelled', message='cancelled', \
                     completed_at={NOW}, updated_at={NOW} \
                     WHERE id=?1 AND status IN ('pending','running')"
                ),
                params![job_id],
            )?;
            Ok(affected == 1)
        })
    }

    /// Return a job to `pending`, clearing terminal state but keeping params.
    /// The next claim stamps a fresh `started_at` epoch.
    pub fn reset_job(&self, job_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                &format!(
                    "UPDATE jobs SET status='pending', progress=0, message='', \
                     updated_at={NOW}, result_json=NULL, error_code=NULL, \
                     error_message=NULL, started_at=NULL, completed_at=NULL \
                     WHERE id=?1"
                ),
                params![job_id],
            )?;
            Ok(affected == 1)
        })
    }

    pub fn update_job(&self, job_id: &str, update: &JobUpdate) -> Result<()> {
        let mut fields: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = &update.status {
            fields.push(format!("status=?{}", values.len() + 1));
            values.push(Box::new(status.clone()));
            if status == "running" {
                fields.push(format!("started_at={NOW}"));
            }
            if matches!(status.as_str(), "completed" | "failed" | "cancelled") {
                fields.push(format!("completed_at={NOW}"));
            }
        }
        if let Some(progress) = update.progress {
            fields.push(format!("progress=?{}", values.len() + 1));
            values.push(Box::new(progress));
        }
        if let Some(message) = &update.message {
            fields.push(format!("message=?{}", values.len() + 1));
            values.push(Box::new(message.clone()));
        }
        if let Some(result) = &update.result {
            fields.push(format!("result_json=?{}", values.len() + 1));
            values.push(Box::new(serde_json::to_string(result)?));
        }
        if let Some(error_code) = &update.error_code {
            fields.push(format!("error_code=?{}", values.len() + 1));
            values.push(Box::new(error_code.clone()));
        }
        if let Some(error_message) = &update.error_message {
            fields.push(format!("error_message=?{}", values.len() + 1));
            values.push(Box::new(error_message.clone()));
        }

        if fields.is_empty() {
            return Ok(());
        }
        fields.push(format!("updated_at={NOW}"));

        let sql = format!(
            "UPDATE jobs SET {} WHERE id=?{}",
            fields.join(", "),
            values.len() + 1
        );
        values.push(Box::new(job_id.to_string()));

        self.with_conn(|conn| {
            conn.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
            Ok(())
        })
    }

    /// Most recent pending-or-running job of a type for a video; the
    /// idempotency probe behind the HTTP gating.
    pub fn get_active_job_for_video(&self, video_id: &str, job_type: &str) -> Result<Option<Job>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM jobs WHERE video_id=?1 AND job_type=?2 \
                     AND status IN ('pending','running') \
                     ORDER BY created_at DESC LIMIT 1",
                    params![video_id, job_type],
                    Job::from_row,
                )
                .optional()?)
        })
    }

    pub fn list_jobs(
        &self,
        status: Option<&str>,
        video_id: Option<&str>,
        job_type: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Paged<Job>> {
        let mut wheres: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        for (column, value) in [
            ("status", status),
            ("video_id", video_id),
            ("job_type", job_type),
        ] {
            if let Some(value) = value {
                wheres.push(format!("{column}=?{}", values.len() + 1));
                values.push(Box::new(value.to_string()));
            }
        }
        let where_sql = if wheres.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", wheres.join(" AND "))
        };

        self.with_conn(|conn| {
            let total = conn.query_row(
                &format!("SELECT COUNT(1) FROM jobs {where_sql}"),
                rusqlite::params_from_iter(values.iter()),
                |row| row.get(0),
            )?;

            let sql = format!(
                "SELECT * FROM jobs {where_sql} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
                values.len() + 1,
                values.len() + 2
            );
            let mut values_page: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            values_page.extend(values);
            values_page.push(Box::new(limit));
            values_page.push(Box::new(offset));

            let mut stmt = conn.prepare(&sql)?;
            let items = stmt
                .query_map(rusqlite::params_from_iter(values_page.iter()), Job::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(Paged { total, items })
        })
    }

    /// Startup crash-recovery sweep: every orphaned `running` job and
    /// per-artifact row returns to `pending` with message `recovered`, and
    /// `processing` videos fall back to `pending`.
    pub fn recover_incomplete_state(&self) -> Result<()> {
        self.with_conn(|conn| {
            for table in ["jobs", "video_indexes", "video_summaries", "video_keyframe_indexes"] {
                conn.execute(
                    &format!(
                        "UPDATE {table} SET status='pending', message='recovered', \
                         updated_at={NOW} WHERE status='running'"
                    ),
                    [],
                )?;
            }
            conn.execute(
                &format!(
                    "UPDATE videos SET status='pending', updated_at={NOW} \
                     WHERE status='processing'"
                ),
                [],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with_video() -> (Store, String) {
        let store = Store::in_memory().unwrap();
        let video = store
            .create_or_get_video("/tmp/a.mp4", "h1", 10.0, 100)
            .unwrap();
        (store, video.id)
    }

    #[test]
    fn test_claim_is_exclusive_and_stamps_epoch() {
        let (store, video_id) = store_with_video();
        let job = store
            .create_job(&video_id, "index", &json!({"from_scratch": true}))
            .unwrap();
        assert!(job.started_at.is_none());

        assert!(store.claim_pending_job(&job.id).unwrap());
        assert!(!store.claim_pending_job(&job.id).unwrap());

        let claimed = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(claimed.status, "running");
        assert!(claimed.started_at.is_some());
    }

    #[test]
    fn test_fetch_next_is_fifo() {
        let (store, video_id) = store_with_video();
        let first = store.create_job(&video_id, "transcribe", &json!({})).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.create_job(&video_id, "index", &json!({})).unwrap();

        let next = store.fetch_next_pending_job().unwrap().unwrap();
        assert_eq!(next.id, first.id);
    }

    #[test]
    fn test_cancel_only_active_jobs() {
        let (store, video_id) = store_with_video();
        let job = store.create_job(&video_id, "index", &json!({})).unwrap();

        assert!(store.cancel_job(&job.id).unwrap());
        let cancelled = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(cancelled.status, "cancelled");
        assert!(cancelled.completed_at.is_some());

        assert!(!store.cancel_job(&job.id).unwrap());
    }

    #[test]
    fn test_reset_clears_terminal_state_and_renews_epoch() {
        let (store, video_id) = store_with_video();
        let job = store
            .create_job(&video_id, "index", &json!({"embed_dim": 384}))
            .unwrap();
        assert!(store.claim_pending_job(&job.id).unwrap());
        let first_epoch = store.get_job(&job.id).unwrap().unwrap().started_at;

        store
            .update_job(
                &job.id,
                &JobUpdate {
                    status: Some("failed".into()),
                    error_code: Some("E_JOB_FAILED".into()),
                    error_message: Some("boom".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(store.reset_job(&job.id).unwrap());
        let reset = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(reset.status, "pending");
        assert_eq!(reset.progress, 0.0);
        assert!(reset.started_at.is_none());
        assert!(reset.error_code.is_none());
        assert!(reset.error_message.is_none());
        assert_eq!(reset.params["embed_dim"], 384);

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(store.claim_pending_job(&job.id).unwrap());
        let second_epoch = store.get_job(&job.id).unwrap().unwrap().started_at;
        assert_ne!(first_epoch, second_epoch);
    }

    #[test]
    fn test_update_job_advances_updated_at() {
        let (store, video_id) = store_with_video();
        let job = store.create_job(&video_id, "index", &json!({})).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store
            .update_job(&job.id, &JobUpdate::progress(0.5, "halfway"))
            .unwrap();
        let updated = store.get_job(&job.id).unwrap().unwrap();
        assert!(updated.updated_at > job.updated_at);
        assert_eq!(updated.message, "halfway");
    }

    #[test]
    fn test_active_job_lookup_ignores_terminal() {
        let (store, video_id) = store_with_video();
        let job = store.create_job(&video_id, "index", &json!({})).unwrap();
        assert_eq!(
            store
                .get_active_job_for_video(&video_id, "index")
                .unwrap()
                .unwrap()
                .id,
            job.id
        );

        store.cancel_job(&job.id).unwrap();
        assert!(store
            .get_active_job_for_video(&video_id, "index")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_recovery_sweep() {
        let (store, video_id) = store_with_video();
        let job = store.create_job(&video_id, "transcribe", &json!({})).unwrap();
        store.claim_pending_job(&job.id).unwrap();
        store.set_video_status(&video_id, "processing").unwrap();

        store.recover_incomplete_state().unwrap();

        let recovered = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(recovered.status, "pending");
        assert_eq!(recovered.message, "recovered");
        assert_eq!(
            store.get_video(&video_id).unwrap().unwrap().status,
            "pending"
        );
    }
}
