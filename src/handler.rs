//! Handler traits and the string-keyed registry the runner dispatches from.

use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fxhash::FxHashMap;

use crate::job::Job;

pub type HandlerResult = Result<serde_json::Value, HandlerError>;

/// Failure reported by a handler.
///
/// Any `std::error::Error` converts into this with `?`, and plain strings
/// convert for ad hoc failures. `HandlerError` itself must never implement
/// `std::error::Error`, otherwise the blanket `From` stops being coherent.
#[derive(Debug)]
pub struct HandlerError(Box<dyn std::error::Error + Send + Sync>);

impl HandlerError {
    pub fn message(message: impl Into<String>) -> Self {
        Self(message.into().into())
    }
}

impl Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl<E: Into<Box<dyn std::error::Error + Send + Sync>>> From<E> for HandlerError {
    fn from(value: E) -> Self {
        Self(value.into())
    }
}

/// Work for one `job_type`.
///
/// ```
/// use async_trait::async_trait;
/// use brigade::prelude::*;
///
/// #[derive(serde::Deserialize)]
/// struct MenuSyncPayload {
///     channel: String,
/// }
///
/// struct ChannelMenuSync;
///
/// #[async_trait]
/// impl JobHandler for ChannelMenuSync {
///     async fn execute(&self, job: &Job) -> HandlerResult {
///         let payload: MenuSyncPayload = job.payload_as()?;
///         // push the menu out to the delivery channel here
///         Ok(serde_json::json!({ "channel": payload.channel, "items": 12 }))
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job) -> HandlerResult;

    /// Overrides the runner's default execution timeout for this handler.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Maps `job_type` strings to their handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: FxHashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `job_type`, replacing any existing entry.
    pub fn register(&mut self, job_type: impl Into<String>, handler: impl JobHandler + 'static) {
        self.handlers.insert(job_type.into(), Arc::new(handler));
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
