use super::message::Envelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message that exhausted its retry budget. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub original_queue: String,
    pub message: Envelope,
    pub error: String,
    #[serde(rename = "timestamp")]
    pub moved_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(original_queue: &str, message: Envelope, error: impl Into<String>) -> Self {
        Self {
            original_queue: original_queue.to_string(),
            message,
            error: error.into(),
            moved_at: Utc::now(),
        }
    }
}
