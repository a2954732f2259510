//! Shared fixtures and handler doubles for the crate's tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound as _, TimeDelta, Utc};
use serde_json::Value;

use crate::db::Database;
use crate::handler::{HandlerError, HandlerResult, JobHandler};
use crate::job::{Job, JobId, JobStatus};
use crate::migrate::Migrator;

/// A migrated in-memory SQLite database.
pub(crate) async fn memory_db() -> Database {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    Migrator::new().run(&db).await.unwrap();
    db
}

/// `Utc::now()` cut to the microsecond precision the store keeps, so stored
/// timestamps compare equal to the originals.
pub(crate) fn now_micros() -> DateTime<Utc> {
    Utc::now()
        .duration_trunc(TimeDelta::microseconds(1))
        .unwrap()
}

pub(crate) fn job_snapshot(job_type: &str) -> Job {
    let now = Utc::now();
    Job {
        id: JobId::new(),
        tenant_id: None,
        job_type: job_type.to_owned(),
        entity_type: None,
        entity_id: None,
        status: JobStatus::Processing,
        payload: None,
        result: None,
        error_message: None,
        retry_count: 0,
        max_retries: 3,
        priority: 0,
        scheduled_at: now,
        next_run_at: now,
        started_at: Some(now),
        completed_at: None,
        created_at: now,
    }
}

/// Succeeds with a fixed result and records every job it sees.
pub(crate) struct RecordingHandler {
    result: Value,
    seen: Arc<Mutex<Vec<Job>>>,
}

impl RecordingHandler {
    pub(crate) fn new(result: Value) -> (Self, Arc<Mutex<Vec<Job>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                result,
                seen: Arc::clone(&seen),
            },
            seen,
        )
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn execute(&self, job: &Job) -> HandlerResult {
        self.seen.lock().unwrap().push(job.clone());
        Ok(self.result.clone())
    }
}

/// Fails every attempt with the same message.
pub(crate) struct FailingHandler {
    message: String,
    calls: Arc<Mutex<Vec<Job>>>,
}

impl FailingHandler {
    pub(crate) fn new(message: &str) -> (Self, Arc<Mutex<Vec<Job>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                message: message.to_owned(),
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn execute(&self, job: &Job) -> HandlerResult {
        self.calls.lock().unwrap().push(job.clone());
        Err(HandlerError::message(self.message.clone()))
    }
}

pub(crate) struct PanickingHandler;

#[async_trait]
impl JobHandler for PanickingHandler {
    async fn execute(&self, _job: &Job) -> HandlerResult {
        panic!("boom in handler");
    }
}

/// Sleeps before succeeding, with an optional per-handler timeout.
pub(crate) struct SlowHandler {
    pub(crate) delay: Duration,
    pub(crate) timeout: Option<Duration>,
}

#[async_trait]
impl JobHandler for SlowHandler {
    async fn execute(&self, _job: &Job) -> HandlerResult {
        tokio::time::sleep(self.delay).await;
        Ok(Value::Null)
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
