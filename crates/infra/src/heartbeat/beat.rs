//! Fixed-cadence heartbeat task for one worker.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use jobrelay_core::WorkerId;

use super::store::{HeartbeatStore, WorkerStatus};
use crate::error::StoreError;
use crate::jobs::WorkerMonitor;

/// Beats for one worker until shutdown, then writes a final `stopped` beat.
pub struct Heartbeater<H> {
    worker_id: WorkerId,
    store: H,
    monitor: Arc<WorkerMonitor>,
    interval: Duration,
}

impl<H: HeartbeatStore> Heartbeater<H> {
    pub fn new(worker_id: WorkerId, store: H, monitor: Arc<WorkerMonitor>, interval: Duration) -> Self {
        Self {
            worker_id,
            store,
            monitor,
            interval,
        }
    }

    /// Send a single beat reflecting the worker's current state.
    pub async fn beat(&self, status: WorkerStatus) -> Result<(), StoreError> {
        let metadata = json!({
            "pid": std::process::id(),
            "stats": self.monitor.snapshot(),
        });
        self.store
            .beat(&self.worker_id, status.as_str(), metadata)
            .await?;
        debug!(worker_id = %self.worker_id, status = %status, "heartbeat");
        Ok(())
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let status = if self.monitor.is_busy() {
                        WorkerStatus::Busy
                    } else {
                        WorkerStatus::Idle
                    };
                    if let Err(e) = self.beat(status).await {
                        warn!(worker_id = %self.worker_id, error = %e, "heartbeat failed");
                    }
                }
            }
        }

        if let Err(e) = self.beat(WorkerStatus::Stopped).await {
            warn!(worker_id = %self.worker_id, error = %e, "final heartbeat failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::InMemoryHeartbeats;

    #[tokio::test]
    async fn beats_immediately_and_marks_stopped_on_shutdown() {
        let store = Arc::new(InMemoryHeartbeats::new());
        let w = WorkerId::parse("worker-hb-1").unwrap();
        let beater = Heartbeater::new(
            w.clone(),
            store.clone(),
            Arc::new(WorkerMonitor::new()),
            Duration::from_secs(3600),
        );

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(beater.run(shutdown.clone()));

        let mut first = None;
        for _ in 0..100 {
            if let Some(beat) = store.get(&w).await.unwrap() {
                first = Some(beat);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let first = first.expect("no heartbeat written");
        assert_eq!(first.status.as_deref(), Some("idle"));
        assert!(first.metadata.unwrap()["stats"].is_object());

        shutdown.cancel();
        handle.await.unwrap();
        assert!(store.get(&w).await.unwrap().unwrap().is_stopped());
    }
}
