//! Job queue boundary and the in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobrelay_core::{Clock, EventId, JobId, SystemClock, WorkerId};

use super::types::{
    EnqueueOutcome, FailOutcome, FailureKind, Job, JobStatus, JobStatusCounts, NewJob, RetryPolicy,
};
use crate::error::StoreError;

/// Lease and retry settings shared by every queue implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// A `processing` job whose lease is older than this may be reclaimed.
    pub lease_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

/// Durable work queue with leases.
///
/// Every operation is atomic with respect to concurrent callers: two workers
/// racing for the same job never both get it, and lease-guarded transitions
/// only apply while the caller still holds the lease.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a job. A collision on `idempotency_key` or `source_event_id`
    /// yields [`EnqueueOutcome::Duplicate`] with the existing job's id.
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Lease up to `batch_size` due jobs (including stale leases), lowest id
    /// first.
    async fn claim(&self, worker_id: &WorkerId, batch_size: usize) -> Result<Vec<Job>, StoreError>;

    /// `processing` → `done`. Returns `false` when `worker_id` does not hold
    /// the lease; nothing changes then.
    async fn complete(&self, id: JobId, worker_id: &WorkerId) -> Result<bool, StoreError>;

    /// `processing` → `pending` for a job the worker never started. The
    /// attempt is not counted. Returns `false` when `worker_id` does not hold
    /// the lease.
    async fn release(&self, id: JobId, worker_id: &WorkerId) -> Result<bool, StoreError>;

    /// Record a failed attempt; see [`Job::fail`].
    async fn fail(
        &self,
        id: JobId,
        worker_id: &WorkerId,
        error: &str,
        kind: FailureKind,
    ) -> Result<FailOutcome, StoreError>;

    async fn counts(&self) -> Result<JobStatusCounts, StoreError>;

    /// `dead`, `failed` and errored `pending` jobs, most recently updated first.
    async fn recent_failures(&self, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Enqueue a fresh copy of a dead job. The dead row is left as is.
    async fn replay_dead(&self, id: JobId) -> Result<JobId, StoreError>;

    /// Delete `done` jobs last updated before `older_than`. Returns the number
    /// of rows removed.
    ///
    /// Pruning never frees a `source_event_id` whose outbox row could still be
    /// bridged again, so a bridge retry after the prune stays a duplicate.
    async fn prune_done(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome, StoreError> {
        (**self).enqueue(job).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(id).await
    }

    async fn claim(&self, worker_id: &WorkerId, batch_size: usize) -> Result<Vec<Job>, StoreError> {
        (**self).claim(worker_id, batch_size).await
    }

    async fn complete(&self, id: JobId, worker_id: &WorkerId) -> Result<bool, StoreError> {
        (**self).complete(id, worker_id).await
    }

    async fn release(&self, id: JobId, worker_id: &WorkerId) -> Result<bool, StoreError> {
        (**self).release(id, worker_id).await
    }

    async fn fail(
        &self,
        id: JobId,
        worker_id: &WorkerId,
        error: &str,
        kind: FailureKind,
    ) -> Result<FailOutcome, StoreError> {
        (**self).fail(id, worker_id, error, kind).await
    }

    async fn counts(&self) -> Result<JobStatusCounts, StoreError> {
        (**self).counts().await
    }

    async fn recent_failures(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        (**self).recent_failures(limit).await
    }

    async fn replay_dead(&self, id: JobId) -> Result<JobId, StoreError> {
        (**self).replay_dead(id).await
    }

    async fn prune_done(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        (**self).prune_done(older_than).await
    }
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: i64,
    jobs: BTreeMap<JobId, Job>,
    by_idempotency_key: HashMap<String, JobId>,
    by_source_event: HashMap<EventId, JobId>,
}

impl QueueState {
    fn existing(&self, job: &NewJob) -> Option<JobId> {
        job.idempotency_key
            .as_ref()
            .and_then(|key| self.by_idempotency_key.get(key))
            .or_else(|| {
                job.source_event_id
                    .as_ref()
                    .and_then(|event| self.by_source_event.get(event))
            })
            .copied()
    }

    fn insert(&mut self, job: NewJob, now: DateTime<Utc>) -> JobId {
        self.next_id += 1;
        let id = JobId::new(self.next_id);
        if let Some(key) = &job.idempotency_key {
            self.by_idempotency_key.insert(key.clone(), id);
        }
        if let Some(event) = job.source_event_id {
            self.by_source_event.insert(event, id);
        }
        self.jobs.insert(id, Job::from_new(id, now, job));
        id
    }

    fn job_mut(&mut self, id: JobId) -> Result<&mut Job, StoreError> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("job {id}")))
    }
}

/// In-memory job queue for tests/dev.
///
/// A single mutex is held for the duration of each call, which gives every
/// operation the same atomicity the Postgres queue gets from row locks.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl InMemoryJobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            config,
            clock,
        }
    }

    pub fn arc(config: QueueConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::poisoned())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome, StoreError> {
        job.validate()?;

        let mut state = self.lock()?;
        if let Some(existing) = state.existing(&job) {
            return Ok(EnqueueOutcome::Duplicate(existing));
        }
        let id = state.insert(job, self.clock.now());
        Ok(EnqueueOutcome::Created(id))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    async fn claim(&self, worker_id: &WorkerId, batch_size: usize) -> Result<Vec<Job>, StoreError> {
        let now = self.clock.now();
        let lease_timeout = self.config.lease_timeout;

        let mut state = self.lock()?;
        let mut claimed = Vec::new();
        for job in state
            .jobs
            .values_mut()
            .filter(|job| job.is_claimable(now, lease_timeout))
            .take(batch_size)
        {
            job.claim(worker_id, now);
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn complete(&self, id: JobId, worker_id: &WorkerId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        Ok(state.job_mut(id)?.complete(worker_id, now))
    }

    async fn release(&self, id: JobId, worker_id: &WorkerId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        Ok(state.job_mut(id)?.release(worker_id, now))
    }

    async fn fail(
        &self,
        id: JobId,
        worker_id: &WorkerId,
        error: &str,
        kind: FailureKind,
    ) -> Result<FailOutcome, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let job = state.job_mut(id)?;
        Ok(job.fail(worker_id, error, kind, &self.config.retry, now))
    }

    async fn counts(&self) -> Result<JobStatusCounts, StoreError> {
        let state = self.lock()?;
        let mut counts = JobStatusCounts::default();
        for job in state.jobs.values() {
            counts.add(job.status, 1);
        }
        Ok(counts)
    }

    async fn recent_failures(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let state = self.lock()?;
        let mut failures: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| is_failure(job))
            .cloned()
            .collect();
        failures.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        failures.truncate(limit);
        Ok(failures)
    }

    async fn replay_dead(&self, id: JobId) -> Result<JobId, StoreError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let dead = state
            .jobs
            .get(&id)
            .ok_or_else(|| StoreError::not_found(format!("job {id}")))?;
        if dead.status != JobStatus::Dead {
            return Err(StoreError::InvalidState(format!(
                "job {id} is {}, only dead jobs can be replayed",
                dead.status
            )));
        }
        let request = dead.replay_request();
        Ok(state.insert(request, now))
    }

    async fn prune_done(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Done && job.updated_at < older_than)
            .map(|job| job.id)
            .collect();

        for id in &expired {
            if let Some(job) = state.jobs.remove(id) {
                // There is no outbox to consult here, so `by_source_event`
                // keeps the pruned id and late bridge retries stay duplicates.
                if let Some(key) = &job.idempotency_key {
                    state.by_idempotency_key.remove(key);
                }
            }
        }
        Ok(expired.len() as u64)
    }
}

pub(crate) fn is_failure(job: &Job) -> bool {
    match job.status {
        JobStatus::Dead | JobStatus::Failed => true,
        JobStatus::Pending => job.last_error.is_some(),
        _ => false,
    }
}
