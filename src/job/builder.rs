use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::job::{JobId, NewJob, DEFAULT_MAX_RETRIES};
use crate::{JobQueue, QueueError};

/// Fluent construction of a job to enqueue.
///
/// ```
/// # use brigade::prelude::*;
/// # async fn demo(queue: &JobQueue) -> Result<(), QueueError> {
/// let job_id = JobBuilder::new("sync_menu")
///     .with_entity("menu", "menu-42")
///     .with_priority(10)
///     .with_payload(serde_json::json!({ "channel": "deliveroo" }))?
///     .enqueue(queue)
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct JobBuilder {
    job_type: String,
    tenant_id: Option<Uuid>,
    entity_type: Option<String>,
    entity_id: Option<String>,
    payload: Option<serde_json::Value>,
    max_retries: u16,
    priority: i32,
    scheduled_at: Option<DateTime<Utc>>,
}

impl JobBuilder {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            tenant_id: None,
            entity_type: None,
            entity_id: None,
            payload: None,
            max_retries: DEFAULT_MAX_RETRIES,
            priority: 0,
            scheduled_at: None,
        }
    }

    pub fn with_tenant(self, tenant_id: Uuid) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..self
        }
    }

    /// Names the domain entity this job acts on, e.g. a menu or an order.
    pub fn with_entity(self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            entity_id: Some(entity_id.into()),
            ..self
        }
    }

    pub fn with_payload(self, payload: impl Serialize) -> Result<Self, QueueError> {
        Ok(Self {
            payload: Some(serde_json::to_value(payload)?),
            ..self
        })
    }

    pub fn with_max_retries(self, max_retries: u16) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    /// Higher priorities dispatch first.
    pub fn with_priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }

    pub fn schedule_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at: Some(scheduled_at),
            ..self
        }
    }

    pub fn schedule_in(self, delay: TimeDelta) -> Self {
        self.schedule_at(Utc::now() + delay)
    }

    pub fn build(self) -> NewJob {
        NewJob {
            tenant_id: self.tenant_id,
            job_type: self.job_type,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            payload: self.payload,
            max_retries: self.max_retries,
            priority: self.priority,
            scheduled_at: self.scheduled_at,
        }
    }

    pub async fn enqueue(self, queue: &JobQueue) -> Result<JobId, QueueError> {
        queue.enqueue(self.build()).await
    }
}
