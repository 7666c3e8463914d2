//! Broker backends. One is chosen at startup and used through `SharedBroker`.

pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;

use crate::domain::message::MessageProperties;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A message as held by a backend while it waits to be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub enqueued_at_ms: i64,
    pub redelivered: bool,
}

impl StoredMessage {
    pub fn new(body: Vec<u8>, properties: MessageProperties) -> Self {
        Self {
            body,
            properties,
            enqueued_at_ms: Utc::now().timestamp_millis(),
            redelivered: false,
        }
    }

    /// Expired once the shorter of the message's own TTL and its queue's TTL has elapsed.
    pub fn is_expired(&self, queue_ttl_ms: Option<u64>, now_ms: i64) -> bool {
        let ttl = match (self.properties.expiration_ms(), queue_ttl_ms) {
            (Some(own), Some(queue)) => own.min(queue),
            (Some(ttl), None) | (None, Some(ttl)) => ttl,
            (None, None) => return false,
        };
        let age = now_ms.saturating_sub(self.enqueued_at_ms);
        age >= i64::try_from(ttl).unwrap_or(i64::MAX)
    }
}
