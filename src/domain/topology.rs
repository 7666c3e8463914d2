//! Static broker topology: queue names, declarations and bindings.

use crate::error::{CourierError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod queues {
    pub const PAYMENT_CREATED: &str = "payment.created";
    pub const PAYMENT_SUCCEEDED: &str = "payment.succeeded";
    pub const PAYMENT_FAILED: &str = "payment.failed";
    pub const BALANCE_UPDATED: &str = "balance.updated";
    pub const DEAD_LETTER: &str = "dlq";

    /// Queues that carry domain events.
    pub const EVENT_QUEUES: [&str; 4] = [
        PAYMENT_CREATED,
        PAYMENT_SUCCEEDED,
        PAYMENT_FAILED,
        BALANCE_UPDATED,
    ];
}

/// Exchange every domain event queue is bound to.
pub const EVENTS_EXCHANGE: &str = "payments.events";

const MAX_QUEUE_NAME_LENGTH: usize = 255;

/// Rejects names a broker would refuse: empty, over 255 bytes, or containing
/// characters outside `[A-Za-z0-9._:-]`.
pub fn validate_queue_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_QUEUE_NAME_LENGTH
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':'));
    if valid {
        Ok(())
    } else {
        Err(CourierError::InvalidQueue(name.to_string()))
    }
}

/// A queue declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Messages older than this are discarded by the broker.
    pub message_ttl_ms: Option<u64>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            message_ttl_ms: None,
        }
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl_ms = Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

/// Binds a queue to an exchange. Declared once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBinding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl QueueBinding {
    pub fn new(queue: &str, exchange: &str, routing_key: &str) -> Self {
        Self {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        }
    }
}

/// The full startup topology: one durable queue per domain event, each bound to
/// [`EVENTS_EXCHANGE`] under its own name, plus the dead-letter queue.
#[derive(Debug, Clone)]
pub struct Topology {
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<QueueBinding>,
}

impl Topology {
    pub fn standard(dead_letter_ttl: Duration) -> Self {
        let mut queue_specs: Vec<QueueSpec> = queues::EVENT_QUEUES
            .iter()
            .map(|name| QueueSpec::durable(*name))
            .collect();
        queue_specs.push(QueueSpec::durable(queues::DEAD_LETTER).with_message_ttl(dead_letter_ttl));

        let bindings = queues::EVENT_QUEUES
            .iter()
            .map(|name| QueueBinding::new(name, EVENTS_EXCHANGE, name))
            .collect();

        Self {
            queues: queue_specs,
            bindings,
        }
    }
}
