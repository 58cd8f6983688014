//! Durable job queue with leases, retry/backoff and dead-lettering, plus the
//! workers that drain it.
//!
//! ## Components
//!
//! - `Job` / `NewJob`: the stored row and the enqueue request
//! - `JobQueue`: claim/lease protocol (in-memory or Postgres)
//! - `HandlerRegistry`: `job_type` → handler lookup
//! - `Worker` / `WorkerPool`: claim loops with per-job failure isolation

pub mod handler;
pub mod pool;
pub mod postgres;
pub mod store;
pub mod types;
pub mod worker;

pub use handler::{DryRunHandler, HandlerError, HandlerRegistry, JobContext, JobHandler};
pub use pool::{PoolConfig, PoolHandle, WorkerPool};
pub use postgres::PostgresJobQueue;
pub use store::{InMemoryJobQueue, JobQueue, QueueConfig};
pub use types::{
    BackoffStrategy, DEFAULT_MAX_ATTEMPTS, EnqueueOutcome, FailOutcome, FailureKind, Job,
    JobStatus, JobStatusCounts, NewJob, RetryPolicy,
};
pub use worker::{CycleReport, JobOutcome, Worker, WorkerConfig, WorkerMonitor, WorkerStats};
