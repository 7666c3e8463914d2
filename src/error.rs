use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CourierError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Publish error: {0}")]
    Publish(String),
    #[error("Consume error: {0}")]
    Consume(String),
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("Lock not acquired within {0:?}")]
    LockTimeout(Duration),
    #[error("Invalid queue name '{0}'")]
    InvalidQueue(String),
    #[error("Queue not found: {0}")]
    QueueNotFound(String),
    #[error("Unknown delivery tag: {0}")]
    UnknownDelivery(u64),
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("Storage error: {0}")]
    Storage(#[from] rocksdb::Error),
}

impl CourierError {
    /// Whether the failure is transient and worth retrying locally.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::ResourceExhausted(_) | Self::LockTimeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CourierError>;
