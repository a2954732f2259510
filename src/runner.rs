//! The polling job runner.
//!
//! One task polls for due jobs on a fixed interval and drives each claimed
//! job through its handler; a second task sweeps up stuck and expired rows.
//! Both stop through the [`RunnerHandle`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde_json::Value;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::backoff::{BackoffStrategy, Strategy};
use crate::db::{Database, StoreError};
use crate::handler::{HandlerRegistry, JobHandler};
use crate::job::Job;
use crate::store::JobStore;
use crate::sweeper::Sweeper;
use crate::QueueError;

/// Tuning knobs for [`JobRunner`].
#[derive(Clone)]
pub struct RunnerConfig {
    pub(crate) poll_interval: Duration,
    pub(crate) batch_size: usize,
    pub(crate) backoff: Arc<dyn Strategy + Send + Sync>,
    pub(crate) default_timeout: Duration,
    pub(crate) stale_after: TimeDelta,
    pub(crate) sweep_interval: Duration,
    pub(crate) retention: Option<TimeDelta>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 5,
            backoff: Arc::new(BackoffStrategy::exponential(4, TimeDelta::minutes(1))),
            default_timeout: Duration::from_secs(30),
            stale_after: TimeDelta::minutes(10),
            sweep_interval: Duration::from_secs(60),
            retention: None,
        }
    }

    /// How often the runner looks for due jobs. Defaults to 5 seconds.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// How many jobs one poll dispatches at most. Defaults to 5.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Retry spacing. Defaults to exponential base 4 over minutes.
    pub fn with_backoff(mut self, backoff: impl Strategy + Send + Sync + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Execution timeout for handlers that do not declare their own.
    /// Defaults to 30 seconds.
    pub fn with_default_timeout(mut self, default_timeout: Duration) -> Self {
        self.default_timeout = default_timeout;
        self
    }

    /// How long a job may sit in `processing` before the sweeper reclaims it.
    /// Defaults to 10 minutes.
    pub fn with_stale_after(mut self, stale_after: TimeDelta) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// How often the sweeper runs. Defaults to 60 seconds.
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Deletes completed and cancelled jobs older than this. Off by default.
    pub fn with_retention(mut self, retention: TimeDelta) -> Self {
        self.retention = Some(retention);
        self
    }
}

enum Outcome {
    Success(Value),
    Failure(String),
}

/// Polls for due jobs and drives them through their handlers.
///
/// Handlers are registered up front; [`JobRunner::start`] consumes the
/// runner, so registering after startup is impossible by construction.
pub struct JobRunner {
    store: JobStore,
    audit: AuditSink,
    registry: HandlerRegistry,
    config: RunnerConfig,
}

impl JobRunner {
    pub fn new(db: Database, config: RunnerConfig) -> Self {
        Self {
            store: JobStore::new(db.clone()),
            audit: AuditSink::new(db),
            registry: HandlerRegistry::new(),
            config,
        }
    }

    /// Registers `handler` for `job_type`, replacing any existing entry.
    pub fn register(&mut self, job_type: impl Into<String>, handler: impl JobHandler + 'static) {
        self.registry.register(job_type, handler);
    }

    /// Spawns the poll and sweep loops.
    pub fn start(self) -> RunnerHandle {
        if self.registry.is_empty() {
            tracing::warn!("Starting the job runner with no registered handlers");
        }
        let cancellation_token = CancellationToken::new();
        let sweeper = Sweeper::new(self.store.clone(), self.audit.clone(), &self.config);
        let sweep_task = sweeper.spawn(cancellation_token.clone());

        let poll_interval = self.config.poll_interval;
        let runner = Arc::new(self);
        let poll_task = tokio::spawn({
            let token = cancellation_token.clone();
            async move {
                let mut tick = tokio::time::interval(poll_interval);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = tick.tick() => runner.poll_once().await,
                        _ = token.cancelled() => {
                            tracing::debug!("Shutting down the job runner");
                            break;
                        },
                    }
                }
            }
        });

        RunnerHandle {
            cancellation_token,
            tasks: vec![poll_task, sweep_task],
        }
    }

    #[instrument(skip(self))]
    pub(crate) async fn poll_once(&self) {
        let due = match self
            .store
            .due_jobs(Utc::now(), self.config.batch_size)
            .await
        {
            Ok(due) => due,
            Err(err) => {
                tracing::error!(?err, "Failed to poll for due jobs: {err}");
                return;
            }
        };
        for job in due {
            let job_id = job.id;
            let _ = self.run_job(job).await.inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to record outcome for job {job_id}: {err}",
                )
            });
        }
    }

    async fn run_job(&self, candidate: Job) -> Result<(), StoreError> {
        let job_id = candidate.id;
        let Some(job) = self.store.claim(job_id, Utc::now()).await? else {
            // Raced with another runner or with a cancellation; the row is no
            // longer ours.
            tracing::debug!(%job_id, "Job {job_id} already claimed");
            return Ok(());
        };

        self.audit
            .record_best_effort(AuditEvent::for_job(
                &job,
                AuditAction::JobStarted,
                serde_json::json!({
                    "job_type": job.job_type,
                    "attempt": job.retry_count + 1,
                }),
            ))
            .await;

        let outcome = match self.registry.get(&job.job_type) {
            Some(handler) => self.invoke(handler, job.clone()).await,
            None => Outcome::Failure(format!(
                "no handler registered for job type `{}`",
                job.job_type
            )),
        };

        match outcome {
            Outcome::Success(result) => self.record_success(&job, result).await,
            Outcome::Failure(message) => self.record_failure(&job, &message).await,
        }
    }

    /// Runs the handler on its own task so a panic cannot take the poll loop
    /// down with it.
    async fn invoke(&self, handler: Arc<dyn JobHandler>, job: Job) -> Outcome {
        let timeout = handler.timeout().unwrap_or(self.config.default_timeout);
        let job_id = job.id;
        tracing::debug!(%job_id, "Executing job {job_id}");

        let fut = async move { tokio::time::timeout(timeout, handler.execute(&job)).await }
            .in_current_span();
        match tokio::spawn(fut).await {
            Ok(Ok(Ok(result))) => Outcome::Success(result),
            Ok(Ok(Err(err))) => Outcome::Failure(err.to_string()),
            Ok(Err(_elapsed)) => {
                Outcome::Failure(format!("handler did not complete within {timeout:?}"))
            }
            Err(join_error) => Outcome::Failure(panic_message(join_error)),
        }
    }

    async fn record_success(&self, job: &Job, result: Value) -> Result<(), StoreError> {
        let job_id = job.id;
        let affected = self
            .store
            .complete(job_id, Some(result.clone()), Utc::now())
            .await?;
        if affected == 0 {
            tracing::warn!(%job_id, "Job {job_id} finished but was no longer processing");
            return Ok(());
        }
        tracing::debug!(%job_id, "Job complete {job_id}");
        self.audit
            .record_best_effort(AuditEvent::for_job(
                job,
                AuditAction::JobCompleted,
                serde_json::json!({ "result": result }),
            ))
            .await;
        Ok(())
    }

    async fn record_failure(&self, job: &Job, message: &str) -> Result<(), StoreError> {
        let job_id = job.id;
        let attempt = job.retry_count + 1;
        let is_final = job.is_final_attempt();
        let delay = self.config.backoff.backoff(attempt as u32);
        // The backoff is anchored to when the attempt started, not to when
        // the handler gave up.
        let next_run_at = job.started_at.unwrap_or_else(Utc::now) + delay;

        let affected = self.store.fail(job_id, message, next_run_at).await?;
        if affected == 0 {
            tracing::warn!(%job_id, "Job {job_id} failed but was no longer processing");
            return Ok(());
        }
        if is_final {
            tracing::error!(%job_id, "Job {job_id} failed on final attempt {attempt}: {message}");
        } else {
            tracing::warn!(
                %job_id,
                "Job {job_id} failed on attempt {attempt}, will retry at {next_run_at}: {message}",
            );
        }
        self.audit
            .record_best_effort(AuditEvent::for_job(
                job,
                AuditAction::JobFailed,
                serde_json::json!({
                    "error": message,
                    "attempt": attempt,
                    "final": is_final,
                    "next_run_at": next_run_at.to_rfc3339(),
                }),
            ))
            .await;
        Ok(())
    }
}

fn panic_message(error: JoinError) -> String {
    let msg = error.to_string();
    let message = match error.try_into_panic() {
        Ok(panic) => panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or(msg),
        Err(_) => msg,
    };
    format!("handler panicked: {message}")
}

/// Stops the runner's background tasks.
pub struct RunnerHandle {
    cancellation_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RunnerHandle {
    /// Signals both loops to stop and waits for them to finish.
    ///
    /// A batch already being worked on completes before the poll loop exits.
    pub async fn stop(self) -> Result<(), QueueError> {
        tracing::debug!("Shutting down job queue tasks");
        self.cancellation_token.cancel();
        futures::future::join_all(self.tasks)
            .await
            .into_iter()
            .collect::<Result<Vec<()>, JoinError>>()
            .map_err(|_| QueueError::Shutdown)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::SqlValue;
    use crate::job::builder::JobBuilder;
    use crate::job::{JobId, JobStatus};
    use crate::test_support::{
        memory_db, now_micros, FailingHandler, PanickingHandler, RecordingHandler, SlowHandler,
    };
    use crate::JobQueue;
    use uuid::Uuid;

    async fn audit_actions(db: &Database) -> Vec<String> {
        db.fetch_all("SELECT action FROM audit_log ORDER BY rowid", vec![])
            .await
            .unwrap()
            .iter()
            .map(|row| row.get_text("action").unwrap())
            .collect()
    }

    #[tokio::test]
    async fn completes_a_job_and_audits_the_lifecycle() {
        let db = memory_db().await;
        let queue = JobQueue::new(db.clone());
        let (handler, seen) = RecordingHandler::new(serde_json::json!({ "items": 3 }));
        let mut runner = JobRunner::new(db.clone(), RunnerConfig::new());
        runner.register("sync_menu", handler);

        let job_id = JobBuilder::new("sync_menu")
            .with_payload(serde_json::json!({ "channel": "deliveroo" }))
            .unwrap()
            .enqueue(&queue)
            .await
            .unwrap();

        runner.poll_once().await;

        let job = queue.get_status(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(serde_json::json!({ "items": 3 })));
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());

        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].id, job_id);
            assert_eq!(seen[0].status, JobStatus::Processing);
            assert_eq!(
                seen[0].payload,
                Some(serde_json::json!({ "channel": "deliveroo" }))
            );
        }

        assert_eq!(audit_actions(&db).await, vec!["job_started", "job_completed"]);
    }

    #[tokio::test]
    async fn failed_jobs_reschedule_with_exponential_backoff() {
        let db = memory_db().await;
        let queue = JobQueue::new(db.clone());
        let (handler, calls) = FailingHandler::new("channel rejected the menu");
        let mut runner = JobRunner::new(db.clone(), RunnerConfig::new());
        runner.register("sync_menu", handler);

        let job_id = JobBuilder::new("sync_menu").enqueue(&queue).await.unwrap();
        runner.poll_once().await;

        let job = queue.get_status(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 1);
        assert_eq!(
            job.error_message.as_deref(),
            Some("channel rejected the menu")
        );
        assert_eq!(
            job.next_run_at - job.started_at.unwrap(),
            TimeDelta::minutes(4)
        );

        // Backed off, so the next poll leaves it alone.
        runner.poll_once().await;
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(audit_actions(&db).await, vec!["job_started", "job_failed"]);
    }

    #[tokio::test]
    async fn backoff_grows_with_each_failed_attempt() {
        let db = memory_db().await;
        let queue = JobQueue::new(db.clone());
        let (handler, _calls) = FailingHandler::new("boom");
        let mut runner = JobRunner::new(db.clone(), RunnerConfig::new());
        runner.register("sync_menu", handler);

        let job_id = JobBuilder::new("sync_menu").enqueue(&queue).await.unwrap();
        runner.poll_once().await;
        let first = queue.get_status(job_id).await.unwrap();
        assert_eq!(
            first.next_run_at - first.started_at.unwrap(),
            TimeDelta::minutes(4)
        );

        // Pull the retry forward so the next poll picks it up now instead of
        // in four minutes.
        db.execute(
            "UPDATE sync_jobs SET next_run_at = ? WHERE id = ?",
            vec![
                SqlValue::from(now_micros() - TimeDelta::minutes(1)),
                SqlValue::from(Uuid::from(job_id)),
            ],
        )
        .await
        .unwrap();
        runner.poll_once().await;

        let second = queue.get_status(job_id).await.unwrap();
        assert_eq!(second.retry_count, 2);
        assert_eq!(
            second.next_run_at - second.started_at.unwrap(),
            TimeDelta::minutes(16)
        );
        assert!(second.next_run_at > first.next_run_at);
    }

    #[tokio::test]
    async fn jobs_stop_after_max_retries_attempts() {
        let db = memory_db().await;
        let queue = JobQueue::new(db.clone());
        let (handler, calls) = FailingHandler::new("boom");
        let config =
            RunnerConfig::new().with_backoff(BackoffStrategy::constant(TimeDelta::zero()));
        let mut runner = JobRunner::new(db.clone(), config);
        runner.register("sync_menu", handler);

        let job_id = JobBuilder::new("sync_menu")
            .with_max_retries(2)
            .enqueue(&queue)
            .await
            .unwrap();

        for _ in 0..4 {
            runner.poll_once().await;
        }

        let job = queue.get_status(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 2);
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn higher_priority_jobs_dispatch_first() {
        let db = memory_db().await;
        let queue = JobQueue::new(db.clone());
        let (handler, seen) = RecordingHandler::new(Value::Null);
        let config = RunnerConfig::new().with_batch_size(1);
        let mut runner = JobRunner::new(db.clone(), config);
        runner.register("sync_menu", handler);

        let low = JobBuilder::new("sync_menu")
            .with_priority(1)
            .enqueue(&queue)
            .await
            .unwrap();
        let high = JobBuilder::new("sync_menu")
            .with_priority(10)
            .enqueue(&queue)
            .await
            .unwrap();

        runner.poll_once().await;
        runner.poll_once().await;

        let order: Vec<JobId> = seen.lock().unwrap().iter().map(|job| job.id).collect();
        assert_eq!(order, vec![high, low]);
    }

    #[tokio::test]
    async fn jobs_without_a_handler_fail() {
        let db = memory_db().await;
        let queue = JobQueue::new(db.clone());
        let mut runner = JobRunner::new(db.clone(), RunnerConfig::new());
        let (handler, _seen) = RecordingHandler::new(Value::Null);
        runner.register("some_other_type", handler);

        let job_id = JobBuilder::new("sync_inventory")
            .enqueue(&queue)
            .await
            .unwrap();
        runner.poll_once().await;

        let job = queue.get_status(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 1);
        assert!(job
            .error_message
            .as_deref()
            .unwrap()
            .contains("no handler registered for job type `sync_inventory`"));
    }

    #[tokio::test]
    async fn slow_handlers_hit_the_default_timeout() {
        let db = memory_db().await;
        let queue = JobQueue::new(db.clone());
        let config = RunnerConfig::new().with_default_timeout(Duration::from_millis(20));
        let mut runner = JobRunner::new(db.clone(), config);
        runner.register(
            "sync_menu",
            SlowHandler {
                delay: Duration::from_secs(5),
                timeout: None,
            },
        );

        let job_id = JobBuilder::new("sync_menu").enqueue(&queue).await.unwrap();
        runner.poll_once().await;

        let job = queue.get_status(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job
            .error_message
            .unwrap()
            .contains("did not complete within"));
    }

    #[tokio::test]
    async fn handlers_can_override_the_default_timeout() {
        let db = memory_db().await;
        let queue = JobQueue::new(db.clone());
        let config = RunnerConfig::new().with_default_timeout(Duration::from_millis(1));
        let mut runner = JobRunner::new(db.clone(), config);
        runner.register(
            "sync_menu",
            SlowHandler {
                delay: Duration::from_millis(20),
                timeout: Some(Duration::from_secs(5)),
            },
        );

        let job_id = JobBuilder::new("sync_menu").enqueue(&queue).await.unwrap();
        runner.poll_once().await;

        assert_eq!(
            queue.get_status(job_id).await.unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn a_panicking_handler_fails_only_its_own_job() {
        let db = memory_db().await;
        let queue = JobQueue::new(db.clone());
        let mut runner = JobRunner::new(db.clone(), RunnerConfig::new());
        runner.register("explodes", PanickingHandler);
        let (handler, _seen) = RecordingHandler::new(Value::Null);
        runner.register("sync_menu", handler);

        let exploding = JobBuilder::new("explodes")
            .with_priority(10)
            .enqueue(&queue)
            .await
            .unwrap();
        let healthy = JobBuilder::new("sync_menu").enqueue(&queue).await.unwrap();

        // One poll picks up both; the panic must not stop the second job.
        runner.poll_once().await;

        let job = queue.get_status(exploding).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("boom in handler"));
        assert_eq!(
            queue.get_status(healthy).await.unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn cancelled_jobs_are_never_dispatched() {
        let db = memory_db().await;
        let queue = JobQueue::new(db.clone());
        let (handler, seen) = RecordingHandler::new(Value::Null);
        let mut runner = JobRunner::new(db.clone(), RunnerConfig::new());
        runner.register("sync_menu", handler);

        let job_id = JobBuilder::new("sync_menu").enqueue(&queue).await.unwrap();
        queue.cancel(job_id).await.unwrap();
        runner.poll_once().await;

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(
            queue.get_status(job_id).await.unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn start_polls_until_stopped() {
        let db = memory_db().await;
        let queue = JobQueue::new(db.clone());
        let (handler, _seen) = RecordingHandler::new(Value::Null);
        let config = RunnerConfig::new().with_poll_interval(Duration::from_millis(10));
        let mut runner = JobRunner::new(db.clone(), config);
        runner.register("sync_menu", handler);

        let handle = runner.start();
        let job_id = JobBuilder::new("sync_menu").enqueue(&queue).await.unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if queue.get_status(job_id).await.unwrap().status == JobStatus::Completed {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "job was never dispatched"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_lets_the_inflight_batch_finish() {
        let db = memory_db().await;
        let queue = JobQueue::new(db.clone());
        let config = RunnerConfig::new().with_poll_interval(Duration::from_millis(5));
        let mut runner = JobRunner::new(db.clone(), config);
        runner.register(
            "sync_menu",
            SlowHandler {
                delay: Duration::from_millis(50),
                timeout: None,
            },
        );
        let job_id = JobBuilder::new("sync_menu").enqueue(&queue).await.unwrap();

        let handle = runner.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            queue.get_status(job_id).await.unwrap().status,
            JobStatus::Processing
        );

        handle.stop().await.unwrap();
        assert_eq!(
            queue.get_status(job_id).await.unwrap().status,
            JobStatus::Completed
        );
    }
}
