use super::message::MessageProperties;
use super::topology::{QueueBinding, QueueSpec};
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Broker-assigned handle for one delivery attempt.
pub type DeliveryTag = u64;

/// A message handed to a consumer and awaiting ack or nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub queue: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    /// Set when the broker has handed this message out before.
    pub redelivered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub message_count: usize,
    pub consumer_count: usize,
}

/// Client side of a durable message broker.
///
/// Connection loss surfaces as `CourierError::Connection`; a full queue as a
/// `false` publish. Implementations must be safe to share between tasks.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<()>;
    fn is_connected(&self) -> bool;
    async fn close(&self) -> Result<()>;

    /// Declares a queue, or confirms an existing declaration.
    async fn assert_queue(&self, spec: &QueueSpec) -> Result<()>;
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<()>;

    /// Returns whether the broker accepted the message.
    async fn publish(&self, queue: &str, body: Vec<u8>, properties: MessageProperties)
    -> Result<bool>;

    /// Waits up to `timeout` for the next ready message on `queue`.
    async fn next_delivery(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>>;
    async fn ack(&self, delivery: &Delivery) -> Result<()>;
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()>;

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats>;
    async fn register_consumer(&self, queue: &str) -> Result<()>;
    async fn unregister_consumer(&self, queue: &str) -> Result<()>;
}

pub type BrokerBox = Box<dyn Broker>;
pub type SharedBroker = Arc<dyn Broker>;
pub type BrokerFactory = Box<dyn Fn() -> BrokerBox + Send + Sync>;
