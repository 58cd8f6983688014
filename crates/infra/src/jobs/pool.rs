//! A set of independent workers, each with its own heartbeater.
//!
//! Workers share nothing but the queue and heartbeat stores; all coordination
//! happens through the queue's atomic claim.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use jobrelay_core::WorkerId;

use super::handler::HandlerRegistry;
use super::store::JobQueue;
use super::worker::{Worker, WorkerConfig, WorkerMonitor, WorkerStats};
use crate::heartbeat::{HeartbeatStore, Heartbeater};

/// Pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Workers are named `{prefix}-{n}`, starting at 1.
    pub worker_prefix: WorkerId,
    pub concurrency: usize,
    pub heartbeat_interval: Duration,
    pub worker: WorkerConfig,
}

/// Spawns and owns the pool's tasks.
pub struct WorkerPool<Q, H> {
    queue: Q,
    heartbeats: H,
    handlers: Arc<HandlerRegistry>,
    config: PoolConfig,
}

impl<Q, H> WorkerPool<Q, H>
where
    Q: JobQueue + Clone + 'static,
    H: HeartbeatStore + Clone + 'static,
{
    pub fn new(queue: Q, heartbeats: H, handlers: Arc<HandlerRegistry>, config: PoolConfig) -> Self {
        Self {
            queue,
            heartbeats,
            handlers,
            config,
        }
    }

    /// Start every worker and heartbeater. They stop when `shutdown` (or the
    /// returned handle) is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> PoolHandle {
        let mut tasks = Vec::with_capacity(self.config.concurrency * 2);
        let mut members = Vec::with_capacity(self.config.concurrency);

        for n in 1..=self.config.concurrency.max(1) {
            let id = self.config.worker_prefix.member(n);
            info!(worker_id = %id, "starting worker");

            let worker = Worker::new(
                id.clone(),
                self.queue.clone(),
                self.handlers.clone(),
                self.config.worker.clone(),
            );
            let monitor = worker.monitor();
            let heartbeater = Heartbeater::new(
                id.clone(),
                self.heartbeats.clone(),
                monitor.clone(),
                self.config.heartbeat_interval,
            );

            let span = info_span!("worker", worker_id = %id);
            tasks.push(tokio::spawn(
                worker.run(shutdown.clone()).instrument(span.clone()),
            ));
            tasks.push(tokio::spawn(
                heartbeater.run(shutdown.clone()).instrument(span),
            ));
            members.push((id, monitor));
        }

        PoolHandle {
            shutdown,
            tasks,
            members,
        }
    }
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct PoolHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    members: Vec<(WorkerId, Arc<WorkerMonitor>)>,
}

impl PoolHandle {
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.members.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Per-worker runtime counters.
    pub fn stats(&self) -> Vec<(WorkerId, WorkerStats)> {
        self.members
            .iter()
            .map(|(id, monitor)| (id.clone(), monitor.snapshot()))
            .collect()
    }

    /// Cancel every task, wait for them to finish and return the final
    /// counters.
    pub async fn shutdown(self) -> Vec<(WorkerId, WorkerStats)> {
        self.shutdown.cancel();
        self.join().await
    }

    /// Wait for every task to finish (after the shutdown token fires).
    pub async fn join(self) -> Vec<(WorkerId, WorkerStats)> {
        for task in self.tasks {
            if let Err(error) = task.await {
                warn!(%error, "pool task panicked");
            }
        }
        self.members
            .iter()
            .map(|(id, monitor)| (id.clone(), monitor.snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::InMemoryHeartbeats;
    use crate::jobs::handler::{HandlerError, JobContext};
    use crate::jobs::store::{InMemoryJobQueue, QueueConfig};
    use crate::jobs::types::{Job, JobStatus, NewJob};
    use serde_json::json;

    #[tokio::test]
    async fn pool_drains_queue_and_reports_stopped_workers() {
        let queue = InMemoryJobQueue::arc(QueueConfig::default());
        for i in 0..20 {
            queue.enqueue(NewJob::new("push", json!({"n": i}))).await.unwrap();
        }
        let heartbeats = Arc::new(InMemoryHeartbeats::new());
        let handlers = HandlerRegistry::new().with("push", |_job: Job, _ctx: JobContext| async move {
            Ok::<(), HandlerError>(())
        });

        let config = PoolConfig {
            worker_prefix: WorkerId::parse("relay").unwrap(),
            concurrency: 3,
            heartbeat_interval: Duration::from_millis(20),
            worker: WorkerConfig {
                poll_interval: Duration::from_millis(5),
                batch_size: 4,
                ..Default::default()
            },
        };
        let handle = WorkerPool::new(queue.clone(), heartbeats.clone(), Arc::new(handlers), config)
            .spawn(CancellationToken::new());

        assert_eq!(
            handle.worker_ids().iter().map(|w| w.to_string()).collect::<Vec<_>>(),
            vec!["relay-1", "relay-2", "relay-3"]
        );

        for _ in 0..200 {
            if queue.counts().await.unwrap().done == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let final_stats = handle.shutdown().await;
        let succeeded: u64 = final_stats.iter().map(|(_, s)| s.jobs_succeeded).sum();

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.done, 20);
        assert_eq!(succeeded, 20);
        assert_eq!(
            queue.get(jobrelay_core::JobId::new(1)).await.unwrap().unwrap().status,
            JobStatus::Done
        );

        let beats = heartbeats.list().await.unwrap();
        assert_eq!(beats.len(), 3);
        assert!(beats.iter().all(|b| b.is_stopped()));
    }
}
