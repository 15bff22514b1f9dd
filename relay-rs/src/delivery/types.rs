use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Processing,
    Delivered,
    Failed,
}

/// A message waiting for outbound delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub queue_id: String,
    /// Id of the message in the message store
    pub message_id: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub status: QueueStatus,
    /// External recipients only
    pub recipients: Vec<String>,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl QueueEntry {
    pub fn new(message_id: &str, recipients: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            queue_id: Uuid::new_v4().to_string(),
            message_id: message_id.to_string(),
            enqueued_at: now,
            attempts: 0,
            status: QueueStatus::Queued,
            recipients,
            next_retry_at: now,
            last_error: None,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Queued && self.next_retry_at <= now
    }
}

/// Outcome of one drain cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
}

impl DrainReport {
    pub fn processed(&self) -> usize {
        self.delivered + self.retried + self.failed
    }
}
