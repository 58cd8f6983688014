//! Worker loop: claim a batch, run each job through its handler, record the
//! outcome.
//!
//! Jobs in a batch run one after another, but each inside its own task so a
//! panicking handler only fails its own job. A store error aborts the current
//! cycle after handing the batch's unstarted jobs back to the queue; the loop
//! carries on after the poll interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobrelay_core::WorkerId;

use super::handler::{HandlerError, HandlerRegistry, JobContext};
use super::store::JobQueue;
use super::types::{FailOutcome, FailureKind, Job};
use crate::error::StoreError;

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Sleep between cycles that did not fill a batch
    pub poll_interval: Duration,
    /// Jobs leased per claim
    pub batch_size: usize,
    /// Per-job execution limit; exceeding it is a retryable failure.
    /// Keep it below the queue's lease timeout, otherwise a slow job can be
    /// reclaimed and run by another worker while it is still executing.
    pub job_timeout: Option<Duration>,
    pub dry_run: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            // 80% of the default lease timeout.
            job_timeout: Some(Duration::from_secs(240)),
            dry_run: false,
        }
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub cycles: u64,
    pub jobs_claimed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead: u64,
    /// Outcomes dropped because the lease had moved on.
    pub outcomes_ignored: u64,
    /// Claimed jobs handed back unstarted after a store error.
    pub jobs_released: u64,
    pub store_errors: u64,
    pub last_error: Option<String>,
}

/// Shared view of a running worker, read by its heartbeater.
#[derive(Debug, Default)]
pub struct WorkerMonitor {
    stats: Mutex<WorkerStats>,
    busy: AtomicBool,
}

impl WorkerMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> WorkerStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Relaxed);
    }

    fn update(&self, f: impl FnOnce(&mut WorkerStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }
}

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying { attempts: u32 },
    Dead { attempts: u32 },
    /// The lease was lost before the outcome could be recorded.
    Ignored,
}

/// Summary of one claim/execute cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub dead: usize,
    pub ignored: usize,
}

/// One worker identity.
pub struct Worker<Q> {
    id: WorkerId,
    queue: Q,
    handlers: Arc<HandlerRegistry>,
    config: WorkerConfig,
    monitor: Arc<WorkerMonitor>,
}

impl<Q: JobQueue> Worker<Q> {
    pub fn new(id: WorkerId, queue: Q, handlers: Arc<HandlerRegistry>, config: WorkerConfig) -> Self {
        Self {
            id,
            queue,
            handlers,
            config,
            monitor: Arc::new(WorkerMonitor::new()),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn monitor(&self) -> Arc<WorkerMonitor> {
        self.monitor.clone()
    }

    /// Claim one batch and run it.
    pub async fn run_once(&self) -> Result<CycleReport, StoreError> {
        self.monitor.update(|s| s.cycles += 1);

        let jobs = self.queue.claim(&self.id, self.config.batch_size).await?;
        let mut report = CycleReport {
            claimed: jobs.len(),
            ..Default::default()
        };
        if jobs.is_empty() {
            return Ok(report);
        }

        debug!(worker_id = %self.id, count = jobs.len(), "claimed jobs");
        self.monitor.update(|s| s.jobs_claimed += jobs.len() as u64);
        self.monitor.set_busy(true);

        let mut jobs = jobs.into_iter();
        let mut result = Ok(());
        while let Some(job) = jobs.next() {
            match self.process(job).await {
                Ok(JobOutcome::Completed) => report.completed += 1,
                Ok(JobOutcome::Retrying { .. }) => report.retried += 1,
                Ok(JobOutcome::Dead { .. }) => report.dead += 1,
                Ok(JobOutcome::Ignored) => report.ignored += 1,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if result.is_err() {
            self.release_unstarted(jobs).await;
        }

        self.monitor.set_busy(false);
        result.map(|()| report)
    }

    /// Best effort: if the store is still down the leases simply expire.
    async fn release_unstarted(&self, jobs: impl Iterator<Item = Job>) {
        for job in jobs {
            match self.queue.release(job.id, &self.id).await {
                Ok(true) => {
                    debug!(worker_id = %self.id, job_id = %job.id, "released unstarted job");
                    self.monitor.update(|s| s.jobs_released += 1);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(worker_id = %self.id, job_id = %job.id, error = %e, "could not release job");
                }
            }
        }
    }

    /// Run until `shutdown` fires. A job already executing is allowed to
    /// finish; there is no mid-execution cancellation.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            worker_id = %self.id,
            batch_size = self.config.batch_size,
            dry_run = self.config.dry_run,
            "worker started"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_once().await {
                // A full batch means more work is probably waiting.
                Ok(report) if report.claimed >= self.config.batch_size => continue,
                Ok(_) => {}
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "worker cycle failed");
                    self.monitor.update(|s| {
                        s.store_errors += 1;
                        s.last_error = Some(e.to_string());
                    });
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(worker_id = %self.id, "worker stopped");
    }

    async fn process(&self, job: Job) -> Result<JobOutcome, StoreError> {
        let job_id = job.id;
        let job_type = job.job_type.clone();

        let Err(err) = self.execute(job).await else {
            if self.queue.complete(job_id, &self.id).await? {
                debug!(worker_id = %self.id, job_id = %job_id, job_type = %job_type, "job completed");
                self.monitor.update(|s| s.jobs_succeeded += 1);
                return Ok(JobOutcome::Completed);
            }
            warn!(worker_id = %self.id, job_id = %job_id, "lease lost before completion was recorded");
            self.monitor.update(|s| s.outcomes_ignored += 1);
            return Ok(JobOutcome::Ignored);
        };

        let message = err.to_string();
        let outcome = self
            .queue
            .fail(job_id, &self.id, &message, err.kind())
            .await?;

        Ok(match outcome {
            FailOutcome::Retrying { attempts, run_at } => {
                warn!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    job_type = %job_type,
                    attempts,
                    run_at = %run_at,
                    error = %message,
                    "job failed, retry scheduled"
                );
                self.monitor.update(|s| {
                    s.jobs_retried += 1;
                    s.last_error = Some(message);
                });
                JobOutcome::Retrying { attempts }
            }
            FailOutcome::Dead { attempts } => {
                error!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    job_type = %job_type,
                    attempts,
                    permanent = err.kind() == FailureKind::Permanent,
                    error = %message,
                    "job is dead"
                );
                self.monitor.update(|s| {
                    s.jobs_dead += 1;
                    s.last_error = Some(message);
                });
                JobOutcome::Dead { attempts }
            }
            FailOutcome::Ignored => {
                warn!(worker_id = %self.id, job_id = %job_id, "lease lost before failure was recorded");
                self.monitor.update(|s| s.outcomes_ignored += 1);
                JobOutcome::Ignored
            }
        })
    }

    /// Run the handler in its own task so a panic stays contained.
    async fn execute(&self, job: Job) -> Result<(), HandlerError> {
        let Some(handler) = self.handlers.resolve(&job.job_type) else {
            return Err(HandlerError::permanent(format!(
                "no handler registered for job_type '{}'",
                job.job_type
            )));
        };

        let ctx = JobContext {
            worker_id: self.id.clone(),
            attempt: job.attempts + 1,
            dry_run: self.config.dry_run,
        };
        let mut task = tokio::spawn(async move { handler.handle(job, ctx).await });

        let joined = match self.config.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    // Wait for the handler future to be dropped so it cannot
                    // overlap with whoever claims the job next.
                    task.abort();
                    let _ = task.await;
                    return Err(HandlerError::retryable(format!(
                        "job timed out after {}s",
                        limit.as_secs_f64()
                    )));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(HandlerError::retryable("handler panicked")),
            Err(e) => Err(HandlerError::retryable(format!("handler task failed: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::{InMemoryJobQueue, QueueConfig};
    use crate::jobs::types::{EnqueueOutcome, JobStatus, JobStatusCounts, NewJob, RetryPolicy};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use jobrelay_core::JobId;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn worker_with(
        queue: Arc<InMemoryJobQueue>,
        handlers: HandlerRegistry,
        config: WorkerConfig,
    ) -> Worker<Arc<InMemoryJobQueue>> {
        Worker::new(WorkerId::parse("w-test").unwrap(), queue, Arc::new(handlers), config)
    }

    #[tokio::test]
    async fn successful_job_is_completed() {
        let queue = InMemoryJobQueue::arc(QueueConfig::default());
        let id = queue.enqueue(NewJob::new("send_email", json!({}))).await.unwrap().job_id();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handlers = HandlerRegistry::new().with("send_email", move |_job: Job, ctx: JobContext| {
            let counter = counter.clone();
            async move {
                assert_eq!(ctx.attempt, 1);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let worker = worker_with(queue.clone(), handlers, WorkerConfig::default());
        let report = worker.run_once().await.unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(queue.get(id).await.unwrap().unwrap().status, JobStatus::Done);
        assert_eq!(worker.monitor().snapshot().jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn failure_in_one_job_does_not_stop_its_siblings() {
        let queue = InMemoryJobQueue::arc(QueueConfig::default());
        queue.enqueue(NewJob::new("explode", json!({}))).await.unwrap();
        queue.enqueue(NewJob::new("malformed", json!({}))).await.unwrap();
        queue.enqueue(NewJob::new("fine", json!({}))).await.unwrap();
        queue.enqueue(NewJob::new("unknown", json!({}))).await.unwrap();

        let handlers = HandlerRegistry::new()
            .with("explode", |job: Job, _ctx: JobContext| async move {
                if job.attempts == 0 {
                    panic!("handler bug");
                }
                Ok(())
            })
            .with("malformed", |_job: Job, _ctx: JobContext| async move {
                Err(HandlerError::permanent("payload missing invoice_id"))
            })
            .with("fine", |_job: Job, _ctx: JobContext| async move { Ok(()) });

        let worker = worker_with(queue.clone(), handlers, WorkerConfig::default());
        let report = worker.run_once().await.unwrap();

        assert_eq!(
            report,
            CycleReport { claimed: 4, completed: 1, retried: 1, dead: 2, ignored: 0 }
        );

        let panicked = queue.get(jobrelay_core::JobId::new(1)).await.unwrap().unwrap();
        assert_eq!(panicked.status, JobStatus::Pending);
        assert_eq!(panicked.last_error.as_deref(), Some("handler panicked"));

        let unknown = queue.get(jobrelay_core::JobId::new(4)).await.unwrap().unwrap();
        assert_eq!(unknown.status, JobStatus::Dead);
        assert!(unknown.last_error.unwrap().contains("no handler registered"));
    }

    #[tokio::test]
    async fn slow_job_times_out_as_retryable() {
        let queue = InMemoryJobQueue::arc(QueueConfig::default());
        let id = queue.enqueue(NewJob::new("slow", json!({}))).await.unwrap().job_id();

        let handlers = HandlerRegistry::new().with("slow", |_job: Job, _ctx: JobContext| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        let config = WorkerConfig {
            job_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };

        let worker = worker_with(queue.clone(), handlers, config);
        let report = worker.run_once().await.unwrap();

        assert_eq!(report.retried, 1);
        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let queue = InMemoryJobQueue::arc(QueueConfig::default());
        let worker = worker_with(queue, HandlerRegistry::new(), WorkerConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        });
        let monitor = worker.monitor();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
        assert!(monitor.snapshot().cycles >= 1);
        assert!(!monitor.is_busy());
    }

    /// Decrements the running count when the handler future is dropped,
    /// including when its task is aborted.
    struct Running(Arc<AtomicUsize>);

    impl Drop for Running {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn timeout_below_lease_keeps_slow_job_from_overlapping() {
        let queue = Arc::new(InMemoryJobQueue::new(QueueConfig {
            lease_timeout: Duration::from_millis(50),
            retry: RetryPolicy::fixed(Duration::ZERO),
        }));
        queue.enqueue(NewJob::new("slow", json!({}))).await.unwrap();

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handlers = Arc::new(HandlerRegistry::new().with("slow", {
            let running = running.clone();
            let peak = peak.clone();
            move |_job: Job, _ctx: JobContext| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    let _guard = Running(running);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                }
            }
        }));
        let config = WorkerConfig {
            batch_size: 1,
            job_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let first = Worker::new(WorkerId::parse("w-a").unwrap(), queue.clone(), handlers.clone(), config.clone());
        let second = Worker::new(WorkerId::parse("w-b").unwrap(), queue.clone(), handlers, config);

        // Without the timeout, w-b would reclaim the expired lease at 60ms
        // while w-a's handler is still sleeping.
        let (a, b) = tokio::join!(first.run_once(), async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            second.run_once().await
        });
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!((a.claimed, a.retried, a.ignored), (1, 1, 0));
        assert_eq!((b.claimed, b.retried, b.ignored), (1, 1, 0));
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(running.load(Ordering::SeqCst), 0);
        assert_eq!(queue.get(JobId::new(1)).await.unwrap().unwrap().attempts, 2);
    }

    /// Queue whose first `complete` call fails with a storage error.
    struct FlakyQueue {
        inner: InMemoryJobQueue,
        broken: AtomicBool,
    }

    #[async_trait]
    impl JobQueue for FlakyQueue {
        async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome, StoreError> {
            self.inner.enqueue(job).await
        }
        async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
            self.inner.get(id).await
        }
        async fn claim(&self, worker_id: &WorkerId, batch_size: usize) -> Result<Vec<Job>, StoreError> {
            self.inner.claim(worker_id, batch_size).await
        }
        async fn complete(&self, id: JobId, worker_id: &WorkerId) -> Result<bool, StoreError> {
            if self.broken.swap(false, Ordering::SeqCst) {
                return Err(StoreError::storage("connection reset"));
            }
            self.inner.complete(id, worker_id).await
        }
        async fn release(&self, id: JobId, worker_id: &WorkerId) -> Result<bool, StoreError> {
            self.inner.release(id, worker_id).await
        }
        async fn fail(
            &self,
            id: JobId,
            worker_id: &WorkerId,
            error: &str,
            kind: FailureKind,
        ) -> Result<FailOutcome, StoreError> {
            self.inner.fail(id, worker_id, error, kind).await
        }
        async fn counts(&self) -> Result<JobStatusCounts, StoreError> {
            self.inner.counts().await
        }
        async fn recent_failures(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
            self.inner.recent_failures(limit).await
        }
        async fn replay_dead(&self, id: JobId) -> Result<JobId, StoreError> {
            self.inner.replay_dead(id).await
        }
        async fn prune_done(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.prune_done(older_than).await
        }
    }

    #[tokio::test]
    async fn store_error_hands_rest_of_batch_back() {
        let queue = Arc::new(FlakyQueue {
            inner: InMemoryJobQueue::new(QueueConfig::default()),
            broken: AtomicBool::new(true),
        });
        for _ in 0..3 {
            queue.enqueue(NewJob::new("fine", json!({}))).await.unwrap();
        }

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handlers = HandlerRegistry::new().with("fine", move |_job: Job, _ctx: JobContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let worker = Worker::new(
            WorkerId::parse("w-test").unwrap(),
            queue.clone(),
            Arc::new(handlers),
            WorkerConfig::default(),
        );

        assert!(matches!(worker.run_once().await, Err(StoreError::Storage(_))));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(worker.monitor().snapshot().jobs_released, 2);

        let counts = queue.counts().await.unwrap();
        assert_eq!((counts.processing, counts.pending), (1, 2));

        // The released jobs are due straight away and keep their attempts.
        let report = worker.run_once().await.unwrap();
        assert_eq!((report.claimed, report.completed), (2, 2));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
