use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobrelay_core::{Clock, SystemClock, WorkerId};

use crate::error::StoreError;

/// Status values written by the relay's own heartbeater. The stored column is
/// free-form; other writers may use other values.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A worker's most recent beat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: WorkerId,
    pub last_seen: DateTime<Utc>,
    pub status: Option<String>,
    pub metadata: Option<JsonValue>,
}

impl Heartbeat {
    /// `true` when the worker announced a clean shutdown.
    pub fn is_stopped(&self) -> bool {
        self.status.as_deref() == Some(WorkerStatus::Stopped.as_str())
    }
}

#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    /// Upsert the worker's row, stamping `last_seen = now`.
    async fn beat(
        &self,
        worker_id: &WorkerId,
        status: &str,
        metadata: JsonValue,
    ) -> Result<Heartbeat, StoreError>;

    async fn get(&self, worker_id: &WorkerId) -> Result<Option<Heartbeat>, StoreError>;

    /// All rows, ordered by worker id.
    async fn list(&self) -> Result<Vec<Heartbeat>, StoreError>;
}

#[async_trait]
impl<S> HeartbeatStore for Arc<S>
where
    S: HeartbeatStore + ?Sized,
{
    async fn beat(
        &self,
        worker_id: &WorkerId,
        status: &str,
        metadata: JsonValue,
    ) -> Result<Heartbeat, StoreError> {
        (**self).beat(worker_id, status, metadata).await
    }

    async fn get(&self, worker_id: &WorkerId) -> Result<Option<Heartbeat>, StoreError> {
        (**self).get(worker_id).await
    }

    async fn list(&self) -> Result<Vec<Heartbeat>, StoreError> {
        (**self).list().await
    }
}

/// In-memory heartbeat registry for tests/dev.
#[derive(Debug)]
pub struct InMemoryHeartbeats {
    rows: RwLock<BTreeMap<WorkerId, Heartbeat>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryHeartbeats {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryHeartbeats {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl HeartbeatStore for InMemoryHeartbeats {
    async fn beat(
        &self,
        worker_id: &WorkerId,
        status: &str,
        metadata: JsonValue,
    ) -> Result<Heartbeat, StoreError> {
        let beat = Heartbeat {
            worker_id: worker_id.clone(),
            last_seen: self.clock.now(),
            status: Some(status.to_string()),
            metadata: Some(metadata),
        };
        let mut rows = self.rows.write().map_err(|_| StoreError::poisoned())?;
        rows.insert(worker_id.clone(), beat.clone());
        Ok(beat)
    }

    async fn get(&self, worker_id: &WorkerId) -> Result<Option<Heartbeat>, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::poisoned())?;
        Ok(rows.get(worker_id).cloned())
    }

    async fn list(&self) -> Result<Vec<Heartbeat>, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::poisoned())?;
        Ok(rows.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrelay_core::ManualClock;
    use serde_json::json;

    #[tokio::test]
    async fn beat_overwrites_the_single_row() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = InMemoryHeartbeats::with_clock(clock.clone());
        let w = WorkerId::parse("worker-a-1").unwrap();

        let first = store.beat(&w, "idle", json!({})).await.unwrap();
        clock.advance(std::time::Duration::from_secs(15));
        let second = store.beat(&w, "busy", json!({"jobs": 1})).await.unwrap();

        assert!(second.last_seen > first.last_seen);
        let rows = store.list().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status.as_deref(), Some("busy"));
        assert_eq!(store.get(&w).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn stopped_status_is_recognised() {
        let store = InMemoryHeartbeats::new();
        let w = WorkerId::parse("worker-a-2").unwrap();
        let beat = store.beat(&w, WorkerStatus::Stopped.as_str(), json!({})).await.unwrap();
        assert!(beat.is_stopped());
    }
}
