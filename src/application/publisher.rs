use crate::domain::event::DomainEvent;
use crate::domain::message::{IdempotencyKey, Message, MessageProperties, PublishOptions};
use crate::domain::ports::SharedBroker;
use crate::domain::topology::{QueueSpec, validate_queue_name};
use crate::error::{CourierError, Result};
use crate::sync::{AtomicCounter, ConcurrentMap, Mutex};
use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use tracing::Instrument;

#[derive(Debug, Default)]
pub struct PublisherStats {
    pub published: AtomicCounter,
    /// Broker refused the write (queue full).
    pub rejected: AtomicCounter,
    /// Channel unavailable or busy.
    pub failed: AtomicCounter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublisherStatsSnapshot {
    pub published: i64,
    pub rejected: i64,
    pub failed: i64,
}

/// Publishes domain events with a generated idempotency key and UTC timestamp.
///
/// All writes funnel through one internal mutex around the broker channel,
/// so concurrent callers never interleave on it.
pub struct ReliableMessagePublisher {
    channel: Mutex<SharedBroker>,
    lock_timeout: Duration,
    sequence: AtomicCounter,
    declared: ConcurrentMap<String, ()>,
    stats: PublisherStats,
}

impl ReliableMessagePublisher {
    pub fn new(broker: SharedBroker, lock_timeout: Duration) -> Self {
        Self {
            channel: Mutex::new(broker),
            lock_timeout,
            // Seeded from the clock so keys stay monotonic across restarts.
            sequence: AtomicCounter::new(Utc::now().timestamp_millis()),
            declared: ConcurrentMap::new(),
            stats: PublisherStats::default(),
        }
    }

    /// Publishes `event` to `queue`.
    ///
    /// Returns `Ok(false)` when the channel is unavailable or the broker refuses
    /// the write. Returns `Err` only for misconfiguration: an invalid queue name
    /// or an event that is not a JSON object with a string `type`.
    pub async fn publish<E>(&self, queue: &str, event: &E, options: PublishOptions) -> Result<bool>
    where
        E: Serialize + ?Sized,
    {
        let message = self.prepare(queue, event, &options)?;
        self.send(&message).await
    }

    /// Like [`Self::publish`], also returning the idempotency key stamped on the message.
    pub async fn publish_with_key<E>(
        &self,
        queue: &str,
        event: &E,
        options: PublishOptions,
    ) -> Result<(bool, IdempotencyKey)>
    where
        E: Serialize + ?Sized,
    {
        let message = self.prepare(queue, event, &options)?;
        let accepted = self.send(&message).await?;
        Ok((accepted, message.idempotency_key))
    }

    /// Publishes a typed event to its well-known queue.
    pub async fn publish_event(&self, event: &DomainEvent, options: PublishOptions) -> Result<bool> {
        self.publish(event.queue(), event, options).await
    }

    /// Like [`Self::publish`], retrying transient channel failures up to
    /// `max_retries` times with a fixed `delay`. Every attempt carries the same
    /// idempotency key.
    pub async fn publish_with_retry<E>(
        &self,
        queue: &str,
        event: &E,
        options: PublishOptions,
        max_retries: u32,
        delay: Duration,
    ) -> Result<bool>
    where
        E: Serialize + ?Sized,
    {
        let message = self.prepare(queue, event, &options)?;
        for attempt in 0..=max_retries {
            if self.send(&message).await? {
                return Ok(true);
            }
            if attempt < max_retries {
                tracing::debug!(queue, attempt = attempt + 1, max_retries, "publish failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
        let error = CourierError::Publish(format!("gave up after {} attempts", max_retries.saturating_add(1)));
        tracing::warn!(queue, idempotency_key = %message.idempotency_key, error = %error, "publish retries exhausted");
        Ok(false)
    }

    /// Sends an existing message again, keeping its idempotency key and timestamp.
    pub async fn republish(&self, message: &Message) -> Result<bool> {
        validate_queue_name(&message.queue)?;
        self.send(message).await
    }

    pub fn stats(&self) -> PublisherStatsSnapshot {
        PublisherStatsSnapshot {
            published: self.stats.published.get(),
            rejected: self.stats.rejected.get(),
            failed: self.stats.failed.get(),
        }
    }

    fn prepare<E>(&self, queue: &str, event: &E, options: &PublishOptions) -> Result<Message>
    where
        E: Serialize + ?Sized,
    {
        validate_queue_name(queue)?;
        let key = IdempotencyKey::generate(self.sequence.increment());
        Message::from_event(queue, event, key, options)
    }

    /// Writes an already encoded body to `queue`, which must already be declared.
    ///
    /// Takes the same channel lock as [`Self::publish`], so writes that bypass
    /// the envelope still never interleave with other publishes.
    pub async fn publish_encoded(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<bool> {
        let span = tracing::info_span!("publish", queue, message_id = %properties.message_id);
        self.write(queue, body, properties, false).instrument(span).await
    }

    async fn send(&self, message: &Message) -> Result<bool> {
        let (body, properties) = message.to_wire()?;
        let span = tracing::info_span!(
            "publish",
            queue = %message.queue,
            idempotency_key = %message.idempotency_key,
            retry_count = message.retry_count
        );
        self.write(&message.queue, body, properties, true)
            .instrument(span)
            .await
    }

    async fn write(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
        declare: bool,
    ) -> Result<bool> {
        let Some(channel) = self.channel.acquire(Some(self.lock_timeout)).await else {
            self.stats.failed.increment();
            let error = CourierError::LockTimeout(self.lock_timeout);
            tracing::warn!(error = %error, "publish channel busy");
            return Ok(false);
        };

        if declare {
            if let Err(e) = self.ensure_queue(&channel, queue).await {
                return self.channel_failure(e).await;
            }
        }
        match channel.publish(queue, body, properties).await {
            Ok(true) => {
                self.stats.published.increment();
                tracing::debug!("message published");
                Ok(true)
            }
            Ok(false) => {
                self.stats.rejected.increment();
                let error = CourierError::ResourceExhausted(format!("queue '{queue}' is full"));
                tracing::warn!(error = %error, "broker rejected message");
                Ok(false)
            }
            Err(e) => self.channel_failure(e).await,
        }
    }

    async fn ensure_queue(&self, channel: &SharedBroker, queue: &str) -> Result<()> {
        let name = queue.to_string();
        if self.declared.has(&name).await {
            return Ok(());
        }
        channel.assert_queue(&QueueSpec::durable(queue)).await?;
        self.declared.set(name, ()).await;
        Ok(())
    }

    async fn channel_failure(&self, error: CourierError) -> Result<bool> {
        if !error.is_transient() {
            return Err(error);
        }
        self.stats.failed.increment();
        if matches!(error, CourierError::Connection(_)) {
            // The broker may come back without our declarations.
            self.declared.clear().await;
        }
        tracing::warn!(error = %error, "publish channel unavailable");
        Ok(false)
    }
}
