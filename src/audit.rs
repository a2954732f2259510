//! Append-only audit trail for job lifecycle transitions.
//!
//! Audit writes are best effort from the runner's point of view: a failed
//! insert is logged and dropped rather than failing the job transition it
//! describes.

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::db::{Database, SqlValue, StoreError};
use crate::job::Job;

/// Actor recorded for transitions made by the runner itself.
pub const SYSTEM_ACTOR: &str = "system";

pub(crate) const JOB_ENTITY_TYPE: &str = "sync_job";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    JobStarted,
    JobCompleted,
    JobFailed,
    JobReclaimed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobStarted => "job_started",
            Self::JobCompleted => "job_completed",
            Self::JobFailed => "job_failed",
            Self::JobReclaimed => "job_reclaimed",
        }
    }
}

/// One audit entry, before it gets an id and timestamp.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub tenant_id: Option<Uuid>,
    pub actor: String,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub details: Value,
}

impl AuditEvent {
    pub(crate) fn for_job(job: &Job, action: AuditAction, details: Value) -> Self {
        Self {
            tenant_id: job.tenant_id,
            actor: SYSTEM_ACTOR.to_owned(),
            action,
            entity_type: JOB_ENTITY_TYPE.to_owned(),
            entity_id: Some(Uuid::from(job.id).to_string()),
            details,
        }
    }
}

/// Writes [`AuditEvent`]s to the `audit_log` table.
#[derive(Clone, Debug)]
pub struct AuditSink {
    db: Database,
}

impl AuditSink {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn record(&self, event: AuditEvent) -> Result<(), StoreError> {
        self.db
            .execute(
                "INSERT INTO audit_log \
                 (id, tenant_id, actor, action, entity_type, entity_id, details, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                vec![
                    SqlValue::from(Uuid::now_v7()),
                    SqlValue::from(event.tenant_id),
                    SqlValue::from(event.actor),
                    SqlValue::from(event.action.as_str()),
                    SqlValue::from(event.entity_type),
                    SqlValue::from(event.entity_id),
                    SqlValue::from(event.details),
                    SqlValue::from(Utc::now()),
                ],
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn record_best_effort(&self, event: AuditEvent) {
        let action = event.action;
        let _ = self.record(event).await.inspect_err(|err| {
            tracing::warn!(
                ?err,
                action = action.as_str(),
                "Failed to write audit entry: {err}"
            )
        });
    }
}
