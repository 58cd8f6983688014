use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use jobrelay_core::{Clock, EventId, SystemClock};
use jobrelay_events::{NewOutboxEvent, OutboxEvent, QueueStatus};

use super::r#trait::{OutboxCounts, OutboxStore};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Rows {
    next_id: i64,
    rows: BTreeMap<EventId, OutboxEvent>,
}

/// In-memory outbox.
///
/// Intended for tests/dev. Rows live in a `BTreeMap` keyed by id so scans come
/// out oldest first.
#[derive(Debug)]
pub struct InMemoryOutbox {
    inner: RwLock<Rows>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryOutbox {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(Rows::default()),
            clock,
        }
    }

    /// Overwrite a row's queue status. Lets tests stage rows left behind by
    /// other tooling (e.g. `queued`).
    pub fn force_queue_status(&self, id: EventId, status: QueueStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::poisoned())?;
        let row = inner
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("event {id}")))?;
        row.queue_status = status;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn append(&self, event: NewOutboxEvent) -> Result<OutboxEvent, StoreError> {
        event.validate()?;

        let mut inner = self.inner.write().map_err(|_| StoreError::poisoned())?;
        inner.next_id += 1;
        let id = EventId::new(inner.next_id);
        let row = OutboxEvent::from_new(id, self.clock.now(), event);
        inner.rows.insert(id, row.clone());
        Ok(row)
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::poisoned())?;
        Ok(inner.rows.get(&id).cloned())
    }

    async fn fetch_unbridged(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::poisoned())?;
        Ok(inner
            .rows
            .values()
            .filter(|row| row.needs_bridging())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_bridged(&self, id: EventId) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::poisoned())?;
        let row = inner
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("event {id}")))?;

        if row.queue_status.is_bridged() {
            return Ok(false);
        }
        row.queue_status = QueueStatus::Bridged;
        row.queued_at = Some(self.clock.now());
        Ok(true)
    }

    async fn mark_rejected(&self, id: EventId, reason: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::poisoned())?;
        let row = inner
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("event {id}")))?;

        if row.queue_status.is_bridged() || row.is_rejected() {
            return Ok(false);
        }
        row.reject(reason, self.clock.now());
        Ok(true)
    }

    async fn counts(&self) -> Result<OutboxCounts, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::poisoned())?;
        let mut counts = OutboxCounts::default();
        for row in inner.rows.values() {
            counts.add(row.queue_status, row.is_rejected(), 1);
        }
        Ok(counts)
    }
}
