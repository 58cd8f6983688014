use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use jobrelay_core::EventId;

use crate::event::OutboxEvent;

/// Job payload produced when an outbox row is bridged.
///
/// Handlers deserialize this to find out which occurrence they are acting on.
/// `metadata` is the producer's blob, untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub event_id: EventId,
    pub event_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub metadata: JsonValue,
}

impl EventPayload {
    pub fn from_event(event: &OutboxEvent) -> Self {
        Self {
            event_id: event.id,
            event_name: event.event_name.clone(),
            created_at: event.created_at,
            company_id: event.company_id,
            driver_id: event.driver_id,
            request_id: event.request_id.clone(),
            metadata: event.metadata.clone(),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        // Every field is plain data; serialization cannot fail.
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    /// Recover the envelope from a job payload.
    pub fn from_json(value: &JsonValue) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewOutboxEvent;

    #[test]
    fn payload_copies_metadata_verbatim() {
        let metadata = serde_json::json!({"nested": {"raw": [1, 2, 3]}, "s": "x"});
        let event = OutboxEvent::from_new(
            EventId::new(9),
            Utc::now(),
            NewOutboxEvent::new("match_confirmed")
                .request("r-9")
                .metadata(metadata.clone()),
        );

        let payload = EventPayload::from_event(&event);
        let json = payload.to_json();

        assert_eq!(json["event_id"], 9);
        assert_eq!(json["event_name"], "match_confirmed");
        assert_eq!(json["metadata"], metadata);
        assert!(json.get("company_id").is_none());

        let back = EventPayload::from_json(&json).unwrap();
        assert_eq!(back, payload);
    }
}
