use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use jobrelay_core::EventId;
use jobrelay_events::{NewOutboxEvent, OutboxEvent, QueueStatus};

use crate::error::StoreError;

/// Row counts per `queue_status`. Rejected rows are counted apart from the
/// status they were stuck in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxCounts {
    pub pending: u64,
    pub queued: u64,
    pub bridged: u64,
    pub rejected: u64,
}

impl OutboxCounts {
    pub fn add(&mut self, status: QueueStatus, rejected: bool, n: u64) {
        match status {
            QueueStatus::Bridged => self.bridged += n,
            _ if rejected => self.rejected += n,
            QueueStatus::Pending => self.pending += n,
            QueueStatus::Queued => self.queued += n,
        }
    }

    /// Rows the bridge still has to visit.
    pub fn unbridged(&self) -> u64 {
        self.pending + self.queued
    }

    pub fn total(&self) -> u64 {
        self.pending + self.queued + self.bridged + self.rejected
    }
}

/// Storage boundary for the event outbox.
///
/// Implementations must keep ids monotonically increasing so that "oldest
/// first" is simply "lowest id first".
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append a new row. Used by producers and tests; the relay never appends.
    async fn append(&self, event: NewOutboxEvent) -> Result<OutboxEvent, StoreError>;

    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, StoreError>;

    /// Up to `limit` rows not yet bridged nor rejected, lowest id first.
    async fn fetch_unbridged(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError>;

    /// Set `queue_status = bridged` and stamp `queued_at`.
    ///
    /// Returns `false` when the row was already bridged; the row is left
    /// untouched in that case.
    async fn mark_bridged(&self, id: EventId) -> Result<bool, StoreError>;

    /// Record that the row can never become a job: `process_status = failed`,
    /// `last_error = reason`, one more `send_attempts`. Rejected rows are no
    /// longer returned by [`OutboxStore::fetch_unbridged`].
    ///
    /// Returns `false` when the row is already bridged or rejected; nothing
    /// changes then, so racing bridges record a rejection once.
    async fn mark_rejected(&self, id: EventId, reason: &str) -> Result<bool, StoreError>;

    async fn counts(&self) -> Result<OutboxCounts, StoreError>;
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn append(&self, event: NewOutboxEvent) -> Result<OutboxEvent, StoreError> {
        (**self).append(event).await
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxEvent>, StoreError> {
        (**self).get(id).await
    }

    async fn fetch_unbridged(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        (**self).fetch_unbridged(limit).await
    }

    async fn mark_bridged(&self, id: EventId) -> Result<bool, StoreError> {
        (**self).mark_bridged(id).await
    }

    async fn mark_rejected(&self, id: EventId, reason: &str) -> Result<bool, StoreError> {
        (**self).mark_rejected(id, reason).await
    }

    async fn counts(&self) -> Result<OutboxCounts, StoreError> {
        (**self).counts().await
    }
}
