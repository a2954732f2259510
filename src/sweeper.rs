//! Background recovery of stuck jobs and pruning of finished ones.
//!
//! A job stays `processing` forever if its worker dies between claiming and
//! recording an outcome. The sweeper treats any attempt older than the
//! configured threshold as lost and puts the job back on the retry path.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::backoff::Strategy;
use crate::db::StoreError;
use crate::runner::RunnerConfig;
use crate::store::JobStore;

const SWEEP_BATCH: usize = 50;

pub(crate) struct Sweeper {
    store: JobStore,
    audit: AuditSink,
    backoff: Arc<dyn Strategy + Send + Sync>,
    interval: Duration,
    stale_after: TimeDelta,
    retention: Option<TimeDelta>,
}

impl Sweeper {
    pub(crate) fn new(store: JobStore, audit: AuditSink, config: &RunnerConfig) -> Self {
        Self {
            store,
            audit,
            backoff: config.backoff.clone(),
            interval: config.sweep_interval,
            stale_after: config.stale_after,
            retention: config.retention,
        }
    }

    /// The first sweep runs immediately, which recovers jobs left behind by
    /// a crashed process as soon as its replacement starts.
    pub(crate) fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => self.sweep().await,
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the job sweeper");
                        break;
                    },
                }
            }
        })
    }

    pub(crate) async fn sweep(&self) {
        if let Err(err) = self.reclaim_stalled().await {
            tracing::error!(?err, "Failed to reclaim stalled jobs: {err}");
        }
        if let Err(err) = self.prune_finished().await {
            tracing::error!(?err, "Failed to prune finished jobs: {err}");
        }
    }

    async fn reclaim_stalled(&self) -> Result<(), StoreError> {
        let cutoff = Utc::now() - self.stale_after;
        let stalled = self.store.stalled_jobs(cutoff, SWEEP_BATCH).await?;
        for job in stalled {
            let job_id = job.id;
            let attempt = job.retry_count + 1;
            // Unlike a normal failure the delay counts from now; the attempt
            // start this far in the past would make the job due immediately.
            let next_run_at = Utc::now() + self.backoff.backoff(attempt as u32);
            let message = format!(
                "reclaimed: no outcome recorded within {} minutes of starting",
                self.stale_after.num_minutes()
            );
            if self.store.fail(job_id, &message, next_run_at).await? == 0 {
                continue;
            }
            tracing::warn!(%job_id, "Reclaimed stalled job {job_id}");
            self.audit
                .record_best_effort(AuditEvent::for_job(
                    &job,
                    AuditAction::JobReclaimed,
                    serde_json::json!({
                        "stalled_since": job.started_at.map(|at| at.to_rfc3339()),
                        "attempt": attempt,
                        "final": job.is_final_attempt(),
                    }),
                ))
                .await;
        }
        Ok(())
    }

    async fn prune_finished(&self) -> Result<(), StoreError> {
        let Some(retention) = self.retention else {
            return Ok(());
        };
        let pruned = self.store.prune_finished(Utc::now() - retention).await?;
        if pruned > 0 {
            tracing::info!("Pruned {pruned} finished jobs");
        }
        Ok(())
    }
}
