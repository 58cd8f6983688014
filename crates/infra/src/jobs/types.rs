//! Core job types, retry policy and the pure state transitions shared by every
//! queue implementation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobrelay_core::{DomainError, EventId, JobId, WorkerId};

/// Attempts a job gets when the producer does not say otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Stored job status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `run_at`.
    Pending,
    /// Leased by a worker.
    Processing,
    /// Completed successfully.
    Done,
    /// Written only by external tooling; never claimed.
    Failed,
    /// Exhausted its retry budget or failed permanently.
    Dead,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Done,
        JobStatus::Failed,
        JobStatus::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Dead)
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::unknown_status(format!("job status '{s}'")))
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Linear backoff: base * attempt
    Linear,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
}

impl core::str::FromStr for BackoffStrategy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(BackoffStrategy::Fixed),
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" => Ok(BackoffStrategy::Exponential),
            other => Err(DomainError::validation(format!(
                "unknown backoff strategy '{other}'"
            ))),
        }
    }
}

/// Retry delay configuration.
///
/// Delays never decrease as `attempts` grows and never exceed `max_delay`.
/// The retry budget itself lives on each job (`max_attempts`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60 * 60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with linear backoff.
    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };

        delay.min(self.max_delay)
    }
}

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Goes through backoff while retry budget remains.
    Retryable,
    /// Goes straight to `dead`.
    Permanent,
}

/// Result of [`Job::fail`] and of `JobQueue::fail`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailOutcome {
    /// Back to `pending`, eligible again at `run_at`.
    Retrying { attempts: u32, run_at: DateTime<Utc> },
    /// Terminal.
    Dead { attempts: u32 },
    /// The caller no longer holds the lease; nothing changed.
    Ignored,
}

/// Result of an enqueue.
///
/// A uniqueness collision is a successful outcome carrying the id of the job
/// that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "job_id", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Created(JobId),
    Duplicate(JobId),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            EnqueueOutcome::Created(id) | EnqueueOutcome::Duplicate(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueOutcome::Created(_))
    }
}

/// A job ready to be enqueued (not yet assigned an id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub payload: JsonValue,
    pub max_attempts: u32,
    /// Earliest execution time; `None` means "now".
    pub run_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    pub source_event_id: Option<EventId>,
    /// Dead job this one was replayed from.
    pub replayed_from: Option<JobId>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            run_at: None,
            idempotency_key: None,
            source_event_id: None,
            replayed_from: None,
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn source_event(mut self, id: EventId) -> Self {
        self.source_event_id = Some(id);
        self
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.job_type.trim().is_empty() {
            return Err(DomainError::validation("job_type must not be empty"));
        }
        if self.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        if let Some(key) = &self.idempotency_key {
            if key.is_empty() {
                return Err(DomainError::validation("idempotency_key must not be empty"));
            }
        }
        Ok(())
    }
}

/// A persisted job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub payload: JsonValue,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
    pub locked_by: Option<WorkerId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub idempotency_key: Option<String>,
    pub source_event_id: Option<EventId>,
    pub replayed_from: Option<JobId>,
}

impl Job {
    /// Materialize a freshly enqueued row.
    pub fn from_new(id: JobId, now: DateTime<Utc>, new: NewJob) -> Self {
        Self {
            id,
            job_type: new.job_type,
            payload: new.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: new.max_attempts,
            run_at: new.run_at.unwrap_or(now),
            locked_by: None,
            locked_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            idempotency_key: new.idempotency_key,
            source_event_id: new.source_event_id,
            replayed_from: new.replayed_from,
        }
    }

    /// `true` once `now - locked_at` exceeds the lease timeout.
    pub fn lease_expired(&self, now: DateTime<Utc>, lease_timeout: Duration) -> bool {
        match (self.status, self.locked_at) {
            (JobStatus::Processing, Some(locked_at)) => (now - locked_at)
                .to_std()
                .map(|held| held > lease_timeout)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Due `pending` jobs and `processing` jobs with an expired lease.
    pub fn is_claimable(&self, now: DateTime<Utc>, lease_timeout: Duration) -> bool {
        match self.status {
            JobStatus::Pending => self.run_at <= now,
            JobStatus::Processing => self.lease_expired(now, lease_timeout),
            _ => false,
        }
    }

    pub fn is_leased_by(&self, worker_id: &WorkerId) -> bool {
        self.status == JobStatus::Processing && self.locked_by.as_ref() == Some(worker_id)
    }

    /// Take the lease. Reclaiming a stale lease does not touch `attempts`.
    pub fn claim(&mut self, worker_id: &WorkerId, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.locked_by = Some(worker_id.clone());
        self.locked_at = Some(now);
        self.updated_at = now;
    }

    /// Mark done. Returns `false` (and changes nothing) unless `worker_id`
    /// holds the lease.
    pub fn complete(&mut self, worker_id: &WorkerId, now: DateTime<Utc>) -> bool {
        if !self.is_leased_by(worker_id) {
            return false;
        }
        self.status = JobStatus::Done;
        self.clear_lease();
        self.updated_at = now;
        true
    }

    /// Hand an unstarted job back: `processing` → `pending`, due now, without
    /// spending an attempt. Returns `false` unless `worker_id` holds the lease.
    pub fn release(&mut self, worker_id: &WorkerId, now: DateTime<Utc>) -> bool {
        if !self.is_leased_by(worker_id) {
            return false;
        }
        self.status = JobStatus::Pending;
        self.run_at = now;
        self.clear_lease();
        self.updated_at = now;
        true
    }

    /// Record a failed attempt.
    ///
    /// `attempts` never exceeds `max_attempts`; the attempt that reaches it
    /// moves the job to `dead`.
    pub fn fail(
        &mut self,
        worker_id: &WorkerId,
        error: &str,
        kind: FailureKind,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> FailOutcome {
        if !self.is_leased_by(worker_id) {
            return FailOutcome::Ignored;
        }

        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.last_error = Some(error.to_string());
        self.clear_lease();
        self.updated_at = now;

        if kind == FailureKind::Retryable && self.attempts < self.max_attempts {
            self.status = JobStatus::Pending;
            self.run_at = after(now, policy.delay_for_attempt(self.attempts));
            FailOutcome::Retrying {
                attempts: self.attempts,
                run_at: self.run_at,
            }
        } else {
            self.status = JobStatus::Dead;
            FailOutcome::Dead {
                attempts: self.attempts,
            }
        }
    }

    /// The enqueue request that replays this job. Unique keys are not copied.
    pub fn replay_request(&self) -> NewJob {
        NewJob {
            job_type: self.job_type.clone(),
            payload: self.payload.clone(),
            max_attempts: self.max_attempts,
            run_at: None,
            idempotency_key: None,
            source_event_id: None,
            replayed_from: Some(self.id),
        }
    }

    fn clear_lease(&mut self) {
        self.locked_by = None;
        self.locked_at = None;
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub done: u64,
    pub failed: u64,
    pub dead: u64,
}

impl JobStatusCounts {
    pub fn add(&mut self, status: JobStatus, n: u64) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Processing => self.processing += n,
            JobStatus::Done => self.done += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::Dead => self.dead += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.done + self.failed + self.dead
    }
}

/// `now + delay`, saturating instead of panicking on overflow.
pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
