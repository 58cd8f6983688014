//! Operational stats: queue and outbox counts, worker liveness, recent
//! failures and derived alerts.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

use jobrelay_core::{Clock, JobId, SystemClock, WorkerId};

use crate::error::StoreError;
use crate::heartbeat::{Heartbeat, HeartbeatStore};
use crate::jobs::{Job, JobQueue, JobStatus, JobStatusCounts};
use crate::outbox::{OutboxCounts, OutboxStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsConfig {
    /// A heartbeat older than this marks its worker stale.
    pub heartbeat_stale_after: Duration,
    /// `high_pending` fires at or above this many pending jobs.
    pub pending_alert_threshold: u64,
    pub recent_failures_limit: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            heartbeat_stale_after: Duration::from_secs(60),
            pending_alert_threshold: 1000,
            recent_failures_limit: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Alive,
    Stale,
    /// The worker wrote a `stopped` beat on shutdown.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerHealth {
    pub worker_id: WorkerId,
    pub last_seen: DateTime<Utc>,
    pub status: Option<String>,
    pub age_secs: i64,
    pub liveness: Liveness,
    pub metadata: Option<JsonValue>,
}

impl WorkerHealth {
    fn from_heartbeat(beat: Heartbeat, now: DateTime<Utc>, stale_after: Duration) -> Self {
        let age = now.signed_duration_since(beat.last_seen);
        let stale_after = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
        let liveness = if beat.is_stopped() {
            Liveness::Stopped
        } else if age > stale_after {
            Liveness::Stale
        } else {
            Liveness::Alive
        };

        Self {
            worker_id: beat.worker_id,
            last_seen: beat.last_seen,
            status: beat.status,
            age_secs: age.num_seconds().max(0),
            liveness,
            metadata: beat.metadata,
        }
    }
}

/// A failed job as shown by stats (payload omitted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureSummary {
    pub id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for FailureSummary {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type,
            status: job.status,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            last_error: job.last_error,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    /// Heartbeat went stale without a clean shutdown.
    WorkerDown { worker_id: WorkerId, age_secs: i64 },
    /// Jobs are waiting and no worker is alive to take them.
    NoLiveWorkers { pending: u64 },
    HighPending { pending: u64, threshold: u64 },
    DeadJobs { dead: u64 },
}

impl Alert {
    pub fn code(&self) -> &'static str {
        match self {
            Alert::WorkerDown { .. } => "worker_down",
            Alert::NoLiveWorkers { .. } => "no_live_workers",
            Alert::HighPending { .. } => "high_pending",
            Alert::DeadJobs { .. } => "dead_jobs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport {
    pub generated_at: DateTime<Utc>,
    pub jobs: JobStatusCounts,
    pub outbox: OutboxCounts,
    pub workers: Vec<WorkerHealth>,
    pub recent_failures: Vec<FailureSummary>,
    pub alerts: Vec<Alert>,
}

impl StatsReport {
    pub fn has_alert(&self, code: &str) -> bool {
        self.alerts.iter().any(|a| a.code() == code)
    }

    pub fn live_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.liveness == Liveness::Alive)
            .count()
    }
}

/// Read-only view over the three stores.
pub struct StatsService<O, Q, H> {
    outbox: O,
    queue: Q,
    heartbeats: H,
    clock: Arc<dyn Clock>,
    config: StatsConfig,
}

impl<O, Q, H> StatsService<O, Q, H>
where
    O: OutboxStore,
    Q: JobQueue,
    H: HeartbeatStore,
{
    pub fn new(outbox: O, queue: Q, heartbeats: H, config: StatsConfig) -> Self {
        Self::with_clock(outbox, queue, heartbeats, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        outbox: O,
        queue: Q,
        heartbeats: H,
        config: StatsConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            outbox,
            queue,
            heartbeats,
            clock,
            config,
        }
    }

    pub async fn snapshot(&self) -> Result<StatsReport, StoreError> {
        let jobs = self.queue.counts().await?;
        let outbox = self.outbox.counts().await?;
        let beats = self.heartbeats.list().await?;
        let failures = self
            .queue
            .recent_failures(self.config.recent_failures_limit)
            .await?;

        let now = self.clock.now();
        let workers: Vec<WorkerHealth> = beats
            .into_iter()
            .map(|beat| WorkerHealth::from_heartbeat(beat, now, self.config.heartbeat_stale_after))
            .collect();
        let alerts = alerts(&jobs, &workers, self.config.pending_alert_threshold);

        Ok(StatsReport {
            generated_at: now,
            jobs,
            outbox,
            workers,
            recent_failures: failures.into_iter().map(FailureSummary::from).collect(),
            alerts,
        })
    }
}

fn alerts(jobs: &JobStatusCounts, workers: &[WorkerHealth], pending_threshold: u64) -> Vec<Alert> {
    let mut alerts: Vec<Alert> = workers
        .iter()
        .filter(|w| w.liveness == Liveness::Stale)
        .map(|w| Alert::WorkerDown {
            worker_id: w.worker_id.clone(),
            age_secs: w.age_secs,
        })
        .collect();

    if jobs.pending > 0 && !workers.iter().any(|w| w.liveness == Liveness::Alive) {
        alerts.push(Alert::NoLiveWorkers {
            pending: jobs.pending,
        });
    }
    if jobs.pending >= pending_threshold {
        alerts.push(Alert::HighPending {
            pending: jobs.pending,
            threshold: pending_threshold,
        });
    }
    if jobs.dead > 0 {
        alerts.push(Alert::DeadJobs { dead: jobs.dead });
    }
    alerts
}
