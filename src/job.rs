//! Job rows and their lifecycle states.

use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub mod builder;

/// Attempts a job gets when the enqueuer does not say otherwise.
pub const DEFAULT_MAX_RETRIES: u16 = 3;

/// Unique identifier of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the status can never change again.
    ///
    /// Failed is not terminal here: a failed job with attempts left is picked
    /// up again by the next poll.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown job status `{0}`")]
pub struct UnknownStatus(String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownStatus(other.to_owned())),
        }
    }
}

/// A snapshot of one `sync_jobs` row.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: Option<Uuid>,
    pub job_type: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub status: JobStatus,
    pub payload: Option<Value>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Whether the attempt currently underway is the last one.
    ///
    /// `retry_count` counts finished attempts, so a freshly claimed job with
    /// `retry_count` 2 and `max_retries` 3 is on its third and final attempt.
    pub fn is_final_attempt(&self) -> bool {
        self.retry_count + 1 >= self.max_retries
    }

    /// Deserializes the payload into a concrete type.
    ///
    /// A missing payload deserializes as JSON `null`, which suits handlers
    /// whose payload type is an `Option`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone().unwrap_or(Value::Null))
    }
}

/// Everything needed to insert a job; built via [`builder::JobBuilder`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) tenant_id: Option<Uuid>,
    pub(crate) job_type: String,
    pub(crate) entity_type: Option<String>,
    pub(crate) entity_id: Option<String>,
    pub(crate) payload: Option<Value>,
    pub(crate) max_retries: u16,
    pub(crate) priority: i32,
    pub(crate) scheduled_at: Option<DateTime<Utc>>,
}
