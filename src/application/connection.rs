use crate::config::MessagingConfig;
use crate::domain::ports::SharedBroker;
use crate::error::{CourierError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Keeps the broker connection up, retrying with a fixed delay.
pub struct ConnectionManager {
    broker: SharedBroker,
    retry_delay: Duration,
    max_attempts: u32,
}

impl ConnectionManager {
    pub fn new(broker: SharedBroker, retry_delay: Duration, max_attempts: u32) -> Self {
        Self {
            broker,
            retry_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(broker: SharedBroker, config: &MessagingConfig) -> Self {
        Self::new(broker, config.reconnect_delay(), config.reconnect_attempts)
    }

    pub fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }

    /// Connects, trying up to `max_attempts` times.
    pub async fn establish(&self) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            match self.broker.connect().await {
                Ok(()) => {
                    tracing::info!(attempt, "broker connected");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt, max_attempts = self.max_attempts, error = %e, "broker connection failed");
                    last_error = Some(e);
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        let reason = last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string());
        Err(CourierError::Connection(format!(
            "gave up after {} attempts: {reason}",
            self.max_attempts
        )))
    }

    /// Checks the connection every `interval` and re-establishes it when it drops.
    ///
    /// The task ends when `shutdown` turns `true` or its sender goes away.
    pub fn spawn_watchdog(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::debug!(?interval, "connection watchdog started");

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if self.broker.is_connected() {
                            continue;
                        }
                        tracing::warn!("broker connection lost, reconnecting");
                        if let Err(e) = self.establish().await {
                            tracing::error!(error = %e, "reconnect failed");
                        }
                    }
                }
            }
            tracing::debug!("connection watchdog stopped");
        })
    }
}
