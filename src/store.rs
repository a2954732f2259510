//! SQL access to the `sync_jobs` table.
//!
//! Every state transition here is guarded by a status predicate in its
//! `WHERE` clause, so two runners racing for the same row resolve the race in
//! the database: the loser's statement simply affects zero rows.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::db::{Database, Row, SqlValue, StoreError};
use crate::job::{Job, JobId, JobStatus, NewJob, UnknownStatus};

const JOB_COLUMNS: &str = "id, tenant_id, job_type, entity_type, entity_id, status, payload, \
                           result, error_message, retry_count, max_retries, priority, \
                           scheduled_at, next_run_at, started_at, completed_at, created_at";

#[derive(Clone, Debug)]
pub(crate) struct JobStore {
    db: Database,
}

impl JobStore {
    pub(crate) fn new(db: Database) -> Self {
        Self { db }
    }

    pub(crate) async fn insert(&self, new_job: &NewJob) -> Result<JobId, StoreError> {
        let id = JobId::new();
        let now = Utc::now();
        let scheduled_at = new_job.scheduled_at.unwrap_or(now);
        let sql = format!(
            "INSERT INTO sync_jobs ({JOB_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        self.db
            .execute(
                &sql,
                vec![
                    SqlValue::from(Uuid::from(id)),
                    SqlValue::from(new_job.tenant_id),
                    SqlValue::from(new_job.job_type.clone()),
                    SqlValue::from(new_job.entity_type.clone()),
                    SqlValue::from(new_job.entity_id.clone()),
                    SqlValue::from(JobStatus::Pending.as_str()),
                    SqlValue::from(new_job.payload.clone()),
                    SqlValue::Json(None),
                    SqlValue::Text(None),
                    SqlValue::from(0_i64),
                    SqlValue::from(i64::from(new_job.max_retries)),
                    SqlValue::from(new_job.priority),
                    SqlValue::from(scheduled_at),
                    SqlValue::from(scheduled_at),
                    SqlValue::Timestamp(None),
                    SqlValue::Timestamp(None),
                    SqlValue::from(now),
                ],
            )
            .await?;
        Ok(id)
    }

    pub(crate) async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = ?");
        let row = self
            .db
            .fetch_optional(&sql, vec![SqlValue::from(Uuid::from(id))])
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Jobs eligible for dispatch at `now`, most urgent first.
    pub(crate) async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs \
             WHERE status IN ('pending', 'failed') \
               AND next_run_at <= ? \
               AND retry_count < max_retries \
             ORDER BY priority DESC, next_run_at ASC \
             LIMIT ?"
        );
        let rows = self
            .db
            .fetch_all(&sql, vec![SqlValue::from(now), SqlValue::from(limit as i64)])
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Atomically takes ownership of one due job.
    ///
    /// The eligibility conditions are re-checked inside the `UPDATE`, so of
    /// several runners racing for the same row exactly one gets it back and
    /// the rest get `None`.
    pub(crate) async fn claim(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            "UPDATE sync_jobs \
             SET status = 'processing', started_at = ? \
             WHERE id = ? \
               AND status IN ('pending', 'failed') \
               AND next_run_at <= ? \
               AND retry_count < max_retries \
             RETURNING {JOB_COLUMNS}"
        );
        let row = self
            .db
            .fetch_optional(
                &sql,
                vec![
                    SqlValue::from(now),
                    SqlValue::from(Uuid::from(id)),
                    SqlValue::from(now),
                ],
            )
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub(crate) async fn complete(
        &self,
        id: JobId,
        result: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.db
            .execute(
                "UPDATE sync_jobs \
                 SET status = 'completed', result = ?, completed_at = ? \
                 WHERE id = ? AND status = 'processing'",
                vec![
                    SqlValue::from(result),
                    SqlValue::from(now),
                    SqlValue::from(Uuid::from(id)),
                ],
            )
            .await
    }

    /// Records a failed attempt and schedules the next one.
    ///
    /// `retry_count` only ever moves here, so it counts finished attempts.
    pub(crate) async fn fail(
        &self,
        id: JobId,
        message: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.db
            .execute(
                "UPDATE sync_jobs \
                 SET status = 'failed', retry_count = retry_count + 1, \
                     error_message = ?, next_run_at = ? \
                 WHERE id = ? AND status = 'processing'",
                vec![
                    SqlValue::from(message),
                    SqlValue::from(next_run_at),
                    SqlValue::from(Uuid::from(id)),
                ],
            )
            .await
    }

    /// Cancels a job that has not started; returns whether a row changed.
    pub(crate) async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let affected = self
            .db
            .execute(
                "UPDATE sync_jobs \
                 SET status = 'cancelled', completed_at = ? \
                 WHERE id = ? AND status = 'pending'",
                vec![SqlValue::from(now), SqlValue::from(Uuid::from(id))],
            )
            .await?;
        Ok(affected > 0)
    }

    pub(crate) async fn counts_by_status(&self) -> Result<Vec<(JobStatus, i64)>, StoreError> {
        let rows = self
            .db
            .fetch_all(
                "SELECT status, COUNT(*) AS total FROM sync_jobs \
                 GROUP BY status ORDER BY status",
                vec![],
            )
            .await?;
        rows.iter()
            .map(|row| {
                Ok((
                    parse_status(&row.get_text("status")?)?,
                    row.get_i64("total")?,
                ))
            })
            .collect()
    }

    /// Processing jobs whose attempt started at or before `cutoff`.
    pub(crate) async fn stalled_jobs(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs \
             WHERE status = 'processing' AND started_at <= ? \
             ORDER BY started_at ASC \
             LIMIT ?"
        );
        let rows = self
            .db
            .fetch_all(
                &sql,
                vec![SqlValue::from(cutoff), SqlValue::from(limit as i64)],
            )
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Deletes terminal jobs finished at or before `cutoff`.
    pub(crate) async fn prune_finished(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.db
            .execute(
                "DELETE FROM sync_jobs \
                 WHERE status IN ('completed', 'cancelled') AND completed_at <= ?",
                vec![SqlValue::from(cutoff)],
            )
            .await
    }
}

pub(crate) fn job_from_row(row: &Row) -> Result<Job, StoreError> {
    Ok(Job {
        id: row.get_uuid("id")?.into(),
        tenant_id: row.opt_uuid("tenant_id")?,
        job_type: row.get_text("job_type")?,
        entity_type: row.opt_text("entity_type")?,
        entity_id: row.opt_text("entity_id")?,
        status: parse_status(&row.get_text("status")?)?,
        payload: row.opt_json("payload")?,
        result: row.opt_json("result")?,
        error_message: row.opt_text("error_message")?,
        retry_count: row.get_i64("retry_count")? as i32,
        max_retries: row.get_i64("max_retries")? as i32,
        priority: row.get_i64("priority")? as i32,
        scheduled_at: row.get_timestamp("scheduled_at")?,
        next_run_at: row.get_timestamp("next_run_at")?,
        started_at: row.opt_timestamp("started_at")?,
        completed_at: row.opt_timestamp("completed_at")?,
        created_at: row.get_timestamp("created_at")?,
    })
}

fn parse_status(raw: &str) -> Result<JobStatus, StoreError> {
    raw.parse().map_err(|err: UnknownStatus| StoreError::Decode {
        column: "status".to_owned(),
        message: err.to_string(),
    })
}
