//! Job handlers and the `job_type` → handler registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use jobrelay_core::WorkerId;

use super::types::{FailureKind, Job};

/// Execution context passed to every handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub worker_id: WorkerId,
    /// 1-based number of this attempt.
    pub attempt: u32,
    /// Handlers must simulate side effects when set.
    pub dry_run: bool,
}

/// Error returned by a handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Transient; the job is retried after backoff while budget remains.
    #[error("{0}")]
    Retryable(String),
    /// Do not retry; the job goes straight to `dead`.
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            HandlerError::Retryable(_) => FailureKind::Retryable,
            HandlerError::Permanent(_) => FailureKind::Permanent,
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Retryable(format!("{err:#}"))
    }
}

/// Executes one job type.
///
/// Delivery is at-least-once: a handler may run again for the same job after
/// a worker crash, so side effects must be idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job, ctx: JobContext) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, job: Job, ctx: JobContext) -> Result<(), HandlerError> {
        (self)(job, ctx).await
    }
}

/// Handler registry.
///
/// Lookup order: exact `job_type`, then the longest matching `prefix.*`
/// pattern, then `*`.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<&String> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("HandlerRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an exact job type, a `prefix.*` category or `*`.
    pub fn register<H>(&mut self, pattern: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(pattern.into(), Arc::new(handler));
    }

    pub fn with<H>(mut self, pattern: impl Into<String>, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.register(pattern, handler);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn resolve(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        if let Some(handler) = self.handlers.get(job_type) {
            return Some(handler.clone());
        }

        // Category match, e.g. "email.*" matches "email.welcome".
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix('*')?;
                (prefix.ends_with('.') && job_type.starts_with(prefix))
                    .then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, handler)) = category {
            return Some(handler.clone());
        }

        self.handlers.get("*").cloned()
    }
}

/// Handler that logs the job and reports success without side effects.
///
/// Refuses to run outside dry-run mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunHandler;

#[async_trait]
impl JobHandler for DryRunHandler {
    async fn handle(&self, job: Job, ctx: JobContext) -> Result<(), HandlerError> {
        if !ctx.dry_run {
            return Err(HandlerError::permanent(format!(
                "no live handler for job_type '{}'",
                job.job_type
            )));
        }
        info!(
            worker_id = %ctx.worker_id,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = ctx.attempt,
            "dry run: simulated job"
        );
        Ok(())
    }
}
