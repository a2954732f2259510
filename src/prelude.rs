//! Convenient flat imports for working with the job queue.
//!
//! ```
//! use brigade::prelude::*;
//! ```

pub use crate::audit::{AuditAction, AuditEvent, AuditSink, SYSTEM_ACTOR};
pub use crate::backoff::{BackoffStrategy, Jitter, Strategy};
pub use crate::db::{Database, Row, SqlValue, StoreError};
pub use crate::handler::{HandlerError, HandlerRegistry, HandlerResult, JobHandler};
pub use crate::job::builder::JobBuilder;
pub use crate::job::{Job, JobId, JobStatus, NewJob};
pub use crate::migrate::{MigrateError, Migrator};
pub use crate::runner::{JobRunner, RunnerConfig, RunnerHandle};
pub use crate::{JobQueue, QueueError};
