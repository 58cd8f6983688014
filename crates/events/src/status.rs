use core::str::FromStr;
use serde::{Deserialize, Serialize};

use jobrelay_core::DomainError;

/// Delivery outcome of an outbox row for consumers outside the job queue.
///
/// The relay only ever writes `failed`, on rows it cannot turn into a job;
/// unbridged `failed` rows are skipped by every bridge.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    #[default]
    Pending,
    Sent,
    Failed,
    Ignored,
}

/// Whether the relay has materialized an outbox row into a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Not yet seen by a bridge.
    #[default]
    Pending,
    /// Insert attempted but not confirmed. Never written by the bridge, but
    /// rows in this state are still bridged (and confirmed) by it.
    Queued,
    /// Exactly one job exists for this row.
    Bridged,
}

impl ProcessStatus {
    pub const ALL: [ProcessStatus; 4] = [
        ProcessStatus::Pending,
        ProcessStatus::Sent,
        ProcessStatus::Failed,
        ProcessStatus::Ignored,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Pending => "pending",
            ProcessStatus::Sent => "sent",
            ProcessStatus::Failed => "failed",
            ProcessStatus::Ignored => "ignored",
        }
    }
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 3] = [QueueStatus::Pending, QueueStatus::Queued, QueueStatus::Bridged];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Queued => "queued",
            QueueStatus::Bridged => "bridged",
        }
    }

    /// `true` once the row needs no further bridging.
    pub fn is_bridged(&self) -> bool {
        matches!(self, QueueStatus::Bridged)
    }
}

impl FromStr for ProcessStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProcessStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::unknown_status(format!("process_status '{s}'")))
    }
}

impl FromStr for QueueStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::unknown_status(format!("queue_status '{s}'")))
    }
}

impl core::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_strings_match_serde_names() {
        for status in QueueStatus::ALL {
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, serde_json::Value::String(status.as_str().to_string()));
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
        }
        for status in ProcessStatus::ALL {
            assert_eq!(status.as_str().parse::<ProcessStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(matches!(
            "archived".parse::<QueueStatus>(),
            Err(DomainError::UnknownStatus(_))
        ));
    }
}
