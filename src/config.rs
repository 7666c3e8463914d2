use crate::error::{CourierError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for the messaging layer.
///
/// Every field has a default, so a config file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Retries after the first failed attempt before a message is dead-lettered.
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub dead_letter_ttl_ms: u64,
    pub queue_capacity: usize,
    /// Deliveries a consumer may have in flight at once.
    pub prefetch: usize,
    pub poll_interval_ms: u64,
    pub publish_lock_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub reconnect_attempts: u32,
    /// How long processed idempotency keys are remembered. `null` disables deduplication.
    pub dedup_ttl_ms: Option<u64>,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 60_000,
            dead_letter_ttl_ms: 86_400_000,
            queue_capacity: 10_000,
            prefetch: 16,
            poll_interval_ms: 250,
            publish_lock_timeout_ms: 5_000,
            reconnect_delay_ms: 5_000,
            reconnect_attempts: 10,
            dedup_ttl_ms: Some(3_600_000),
        }
    }
}

impl MessagingConfig {
    /// Loads and validates a JSON config file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(CourierError::Config("queue_capacity must be > 0".to_string()));
        }
        if self.prefetch == 0 {
            return Err(CourierError::Config("prefetch must be > 0".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(CourierError::Config("poll_interval_ms must be > 0".to_string()));
        }
        if self.max_retry_delay_ms < self.base_retry_delay_ms {
            return Err(CourierError::Config(
                "max_retry_delay_ms must be >= base_retry_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn dead_letter_ttl(&self) -> Duration {
        Duration::from_millis(self.dead_letter_ttl_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn publish_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_lock_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn dedup_ttl(&self) -> Option<Duration> {
        self.dedup_ttl_ms.map(Duration::from_millis)
    }
}
