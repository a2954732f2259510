//! Durable background jobs for a restaurant back-office platform.
//!
//! The slow work of the platform, e.g. pushing menus out to delivery
//! channels, importing POS data, or producing nightly exports, runs as jobs
//! persisted in a `sync_jobs` table. The table lives on SQLite or Postgres
//! behind a single [`Database`] handle; statements are written once and
//! translated per dialect. A [`JobQueue`] enqueues, cancels, and inspects
//! jobs, while a [`runner::JobRunner`] polls for due rows, claims each one
//! atomically, runs the registered handler under a timeout, and retries
//! failures with exponential backoff. Every lifecycle transition also lands
//! in an append-only `audit_log`.
//!
//! ```no_run
//! use async_trait::async_trait;
//! use brigade::prelude::*;
//!
//! struct MenuSync;
//!
//! #[async_trait]
//! impl JobHandler for MenuSync {
//!     async fn execute(&self, job: &Job) -> HandlerResult {
//!         let channel: String = job.payload_as()?;
//!         Ok(serde_json::json!({ "synced": channel }))
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("sqlite:jobs.db").await?;
//!     Migrator::new().run(&db).await?;
//!
//!     let mut runner = JobRunner::new(db.clone(), RunnerConfig::new());
//!     runner.register("sync_menu", MenuSync);
//!     let handle = runner.start();
//!
//!     let queue = JobQueue::new(db);
//!     let job_id = JobBuilder::new("sync_menu")
//!         .with_payload("deliveroo")?
//!         .enqueue(&queue)
//!         .await?;
//!     println!("enqueued {job_id}");
//!
//!     handle.stop().await?;
//!     Ok(())
//! }
//! ```

use chrono::Utc;
use thiserror::Error;

pub mod audit;
pub mod backoff;
pub mod db;
pub mod handler;
pub mod job;
pub mod migrate;
pub mod prelude;
pub mod runner;

pub(crate) mod store;
pub(crate) mod sweeper;

#[cfg(test)]
pub(crate) mod test_support;

pub use db::Database;

use db::StoreError;
use job::{Job, JobId, JobStatus, NewJob};
use store::JobStore;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("job {id} is {status}, only pending jobs can be cancelled")]
    NotCancellable { id: JobId, status: JobStatus },
    #[error("job_type must not be empty")]
    EmptyJobType,
    #[error("failed to encode job payload")]
    Payload(#[from] serde_json::Error),
    #[error("failed to shut down the job runner cleanly")]
    Shutdown,
}

/// Client surface for enqueueing and inspecting jobs.
///
/// Cloneable and cheap to pass around; every clone talks to the same
/// database.
#[derive(Clone, Debug)]
pub struct JobQueue {
    store: JobStore,
}

impl JobQueue {
    pub fn new(db: Database) -> Self {
        Self {
            store: JobStore::new(db),
        }
    }

    /// Inserts a job; it becomes eligible at its scheduled time, or
    /// immediately when no schedule was given.
    pub async fn enqueue(&self, new_job: NewJob) -> Result<JobId, QueueError> {
        if new_job.job_type.trim().is_empty() {
            return Err(QueueError::EmptyJobType);
        }
        let id = self.store.insert(&new_job).await?;
        tracing::debug!(job_id = %id, job_type = new_job.job_type, "Enqueued job {id}");
        Ok(id)
    }

    /// Cancels a job that has not started yet.
    ///
    /// Jobs already claimed by a runner cannot be called back; those return
    /// [`QueueError::NotCancellable`] with their current status.
    pub async fn cancel(&self, id: JobId) -> Result<(), QueueError> {
        if self.store.cancel(id, Utc::now()).await? {
            tracing::debug!(job_id = %id, "Cancelled job {id}");
            return Ok(());
        }
        match self.store.get(id).await? {
            Some(job) => Err(QueueError::NotCancellable {
                id,
                status: job.status,
            }),
            None => Err(QueueError::JobNotFound(id)),
        }
    }

    /// The current snapshot of a job.
    pub async fn get_status(&self, id: JobId) -> Result<Job, QueueError> {
        self.store
            .get(id)
            .await?
            .ok_or(QueueError::JobNotFound(id))
    }

    /// How many jobs currently sit in each status.
    pub async fn counts_by_status(&self) -> Result<Vec<(JobStatus, i64)>, QueueError> {
        Ok(self.store.counts_by_status().await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::job::builder::JobBuilder;
    use crate::test_support::memory_db;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn enqueued_jobs_are_immediately_visible() {
        let queue = JobQueue::new(memory_db().await);
        let job_id = JobBuilder::new("sync_menu")
            .with_priority(3)
            .enqueue(&queue)
            .await
            .unwrap();

        let job = queue.get_status(job_id).await.unwrap();
        assert_eq!(job.id, job_id);
        assert_eq!(job.job_type, "sync_menu");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 3);
    }

    #[tokio::test]
    async fn unknown_jobs_are_reported_as_missing() {
        let queue = JobQueue::new(memory_db().await);
        assert_matches!(
            queue.get_status(JobId::new()).await,
            Err(QueueError::JobNotFound(_))
        );
        assert_matches!(
            queue.cancel(JobId::new()).await,
            Err(QueueError::JobNotFound(_))
        );
    }

    #[tokio::test]
    async fn cancel_works_once_per_job() {
        let queue = JobQueue::new(memory_db().await);
        let job_id = JobBuilder::new("sync_menu").enqueue(&queue).await.unwrap();

        queue.cancel(job_id).await.unwrap();
        assert_eq!(
            queue.get_status(job_id).await.unwrap().status,
            JobStatus::Cancelled
        );

        assert_matches!(
            queue.cancel(job_id).await,
            Err(QueueError::NotCancellable {
                status: JobStatus::Cancelled,
                ..
            })
        );
    }

    #[tokio::test]
    async fn blank_job_types_are_rejected() {
        let queue = JobQueue::new(memory_db().await);
        assert_matches!(
            queue.enqueue(JobBuilder::new("  ").build()).await,
            Err(QueueError::EmptyJobType)
        );
    }

    #[tokio::test]
    async fn counts_summarize_the_whole_table() {
        let queue = JobQueue::new(memory_db().await);
        JobBuilder::new("a").enqueue(&queue).await.unwrap();
        JobBuilder::new("b").enqueue(&queue).await.unwrap();
        let cancelled = JobBuilder::new("c").enqueue(&queue).await.unwrap();
        queue.cancel(cancelled).await.unwrap();

        assert_eq!(
            queue.counts_by_status().await.unwrap(),
            vec![(JobStatus::Cancelled, 1), (JobStatus::Pending, 2)]
        );
    }
}
