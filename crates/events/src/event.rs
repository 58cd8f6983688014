use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use jobrelay_core::{DomainError, EventId};

use crate::status::{ProcessStatus, QueueStatus};

/// An outbox row ready to be appended (not yet assigned an id).
///
/// Producers build this inside the same transaction as the business write it
/// describes. Everything except `event_name` is optional; `metadata` is opaque
/// to the relay and is copied into the job payload verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxEvent {
    pub event_name: String,
    pub company_id: Option<Uuid>,
    pub driver_id: Option<Uuid>,
    pub request_id: Option<String>,
    pub metadata: JsonValue,
}

impl NewOutboxEvent {
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            company_id: None,
            driver_id: None,
            request_id: None,
            metadata: JsonValue::Object(Default::default()),
        }
    }

    pub fn company(mut self, company_id: Uuid) -> Self {
        self.company_id = Some(company_id);
        self
    }

    pub fn driver(mut self, driver_id: Uuid) -> Self {
        self.driver_id = Some(driver_id);
        self
    }

    pub fn request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.event_name.trim().is_empty() {
            return Err(DomainError::validation("event_name must not be empty"));
        }
        Ok(())
    }
}

/// A persisted outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: EventId,
    pub event_name: String,
    pub created_at: DateTime<Utc>,
    pub company_id: Option<Uuid>,
    pub driver_id: Option<Uuid>,
    pub request_id: Option<String>,
    pub metadata: JsonValue,

    /// Delivery outcome for non-queue consumers.
    pub process_status: ProcessStatus,
    /// Bridging progress.
    pub queue_status: QueueStatus,
    /// When the row was bridged.
    pub queued_at: Option<DateTime<Utc>>,

    pub send_attempts: u32,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// Materialize a freshly appended row.
    pub fn from_new(id: EventId, created_at: DateTime<Utc>, new: NewOutboxEvent) -> Self {
        Self {
            id,
            event_name: new.event_name,
            created_at,
            company_id: new.company_id,
            driver_id: new.driver_id,
            request_id: new.request_id,
            metadata: new.metadata,
            process_status: ProcessStatus::Pending,
            queue_status: QueueStatus::Pending,
            queued_at: None,
            send_attempts: 0,
            last_error: None,
            processed_at: None,
        }
    }

    /// `pending` and `queued` rows are both picked up by the bridge, unless
    /// the row was rejected.
    pub fn needs_bridging(&self) -> bool {
        !self.queue_status.is_bridged() && !self.is_rejected()
    }

    /// An unbridged row whose delivery has failed for good. Rows the queue
    /// refuses end up here, with the reason in `last_error`.
    pub fn is_rejected(&self) -> bool {
        !self.queue_status.is_bridged() && self.process_status == ProcessStatus::Failed
    }

    /// Record why this row can never become a job. `queue_status` is left
    /// alone.
    pub fn reject(&mut self, reason: &str, now: DateTime<Utc>) {
        self.process_status = ProcessStatus::Failed;
        self.send_attempts += 1;
        self.last_error = Some(reason.to_string());
        self.processed_at = Some(now);
    }
}
