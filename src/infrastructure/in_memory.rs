use super::StoredMessage;
use crate::domain::message::MessageProperties;
use crate::domain::ports::{Broker, Delivery, DeliveryTag, QueueStats};
use crate::domain::topology::{QueueBinding, QueueSpec, validate_queue_name};
use crate::error::{CourierError, Result};
use crate::sync::{AtomicCounter, ConcurrentMap, ConcurrentQueue};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Default number of ready messages a single queue may hold.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

struct QueueState {
    spec: QueueSpec,
    ready: ConcurrentQueue<StoredMessage>,
    consumers: AtomicCounter,
}

#[derive(Clone)]
struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct Inner {
    queues: ConcurrentMap<String, Arc<QueueState>>,
    bindings: RwLock<Vec<QueueBinding>>,
    unacked: ConcurrentMap<DeliveryTag, Unacked>,
    next_tag: AtomicCounter,
    connected: AtomicBool,
    failing_connects: AtomicCounter,
    queue_capacity: usize,
}

/// A process-local broker.
///
/// Construct one explicitly at startup and share it by cloning the handle;
/// there is no global instance. Unacked deliveries are requeued when the
/// connection drops, like a real broker does when a channel closes.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Creates a connected broker with the default per-queue capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: ConcurrentMap::new(),
                bindings: RwLock::new(Vec::new()),
                unacked: ConcurrentMap::new(),
                next_tag: AtomicCounter::default(),
                connected: AtomicBool::new(true),
                failing_connects: AtomicCounter::default(),
                queue_capacity,
            }),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(CourierError::Connection(
                "in-memory broker is disconnected".to_string(),
            ))
        }
    }

    async fn queue(&self, name: &str) -> Result<Arc<QueueState>> {
        self.inner
            .queues
            .get(&name.to_string())
            .await
            .ok_or_else(|| CourierError::QueueNotFound(name.to_string()))
    }

    /// Drops the connection. Unacked deliveries go back to their queues.
    pub async fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.requeue_unacked().await;
    }

    /// Makes the next `attempts` calls to `connect` fail.
    pub fn fail_next_connects(&self, attempts: i64) {
        self.inner.failing_connects.set(attempts);
    }

    /// Forgets every queue, binding and in-flight delivery.
    pub async fn reset(&self) {
        self.inner.queues.clear().await;
        self.inner.unacked.clear().await;
        self.inner.bindings.write().await.clear();
        self.inner.failing_connects.set(0);
        self.inner.connected.store(true, Ordering::SeqCst);
    }

    pub async fn unacked_count(&self) -> usize {
        self.inner.unacked.size().await
    }

    pub async fn bindings(&self) -> Vec<QueueBinding> {
        self.inner.bindings.read().await.clone()
    }

    async fn requeue_unacked(&self) {
        for (tag, _) in self.inner.unacked.snapshot().await {
            let Some(unacked) = self.inner.unacked.delete(&tag).await else {
                continue;
            };
            let Ok(queue) = self.queue(&unacked.queue).await else {
                continue;
            };
            let mut message = unacked.message;
            message.redelivered = true;
            queue.ready.requeue_front(message).await;
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<()> {
        loop {
            let remaining = self.inner.failing_connects.get();
            if remaining <= 0 {
                break;
            }
            if self
                .inner
                .failing_connects
                .compare_and_set(remaining, remaining - 1)
            {
                return Err(CourierError::Connection(
                    "in-memory broker refused the connection".to_string(),
                ));
            }
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.disconnect().await;
        Ok(())
    }

    async fn assert_queue(&self, spec: &QueueSpec) -> Result<()> {
        validate_queue_name(&spec.name)?;
        self.ensure_connected()?;

        let state = Arc::new(QueueState {
            spec: spec.clone(),
            ready: ConcurrentQueue::new(self.inner.queue_capacity),
            consumers: AtomicCounter::default(),
        });
        if self.inner.queues.set_if_absent(spec.name.clone(), state).await {
            tracing::debug!(queue = %spec.name, "queue declared");
            return Ok(());
        }

        let existing = self.queue(&spec.name).await?;
        if existing.spec == *spec {
            Ok(())
        } else {
            Err(CourierError::Config(format!(
                "queue '{}' already declared with different settings",
                spec.name
            )))
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<()> {
        self.ensure_connected()?;
        self.queue(&binding.queue).await?;
        let mut bindings = self.inner.bindings.write().await;
        if !bindings.contains(binding) {
            bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<bool> {
        self.ensure_connected()?;
        let state = self.queue(queue).await?;
        Ok(state
            .ready
            .enqueue(StoredMessage::new(body, properties))
            .await)
    }

    async fn next_delivery(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>> {
        self.ensure_connected()?;
        let state = self.queue(queue).await?;
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(message) = state.ready.dequeue_blocking(Some(remaining)).await else {
                return Ok(None);
            };
            if !self.is_connected() {
                // Dropped while this call was waiting.
                state.ready.requeue_front(message).await;
                return Err(CourierError::Connection(
                    "in-memory broker is disconnected".to_string(),
                ));
            }
            if message.is_expired(state.spec.message_ttl_ms, Utc::now().timestamp_millis()) {
                tracing::debug!(queue, message_id = %message.properties.message_id, "discarding expired message");
                continue;
            }

            let tag = self.inner.next_tag.increment() as DeliveryTag;
            let delivery = Delivery {
                tag,
                queue: queue.to_string(),
                body: message.body.clone(),
                properties: message.properties.clone(),
                redelivered: message.redelivered,
            };
            self.inner
                .unacked
                .set(
                    tag,
                    Unacked {
                        queue: queue.to_string(),
                        message,
                    },
                )
                .await;
            return Ok(Some(delivery));
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.ensure_connected()?;
        self.inner
            .unacked
            .delete(&delivery.tag)
            .await
            .map(|_| ())
            .ok_or(CourierError::UnknownDelivery(delivery.tag))
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.ensure_connected()?;
        let unacked = self
            .inner
            .unacked
            .delete(&delivery.tag)
            .await
            .ok_or(CourierError::UnknownDelivery(delivery.tag))?;
        if !requeue {
            return Ok(());
        }

        let state = self.queue(&unacked.queue).await?;
        let mut message = unacked.message;
        message.redelivered = true;
        state.ready.requeue_front(message).await;
        Ok(())
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        self.ensure_connected()?;
        let state = self.queue(queue).await?;
        Ok(QueueStats {
            message_count: state.ready.size().await,
            consumer_count: usize::try_from(state.consumers.get()).unwrap_or(0),
        })
    }

    async fn register_consumer(&self, queue: &str) -> Result<()> {
        self.queue(queue).await?.consumers.increment();
        Ok(())
    }

    async fn unregister_consumer(&self, queue: &str) -> Result<()> {
        self.queue(queue).await?.consumers.update(|n| (n - 1).max(0));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(id: &str) -> MessageProperties {
        MessageProperties {
            message_id: id.to_string(),
            persistent: true,
            priority: 0,
            expiration: None,
        }
    }

    async fn broker_with_queue(name: &str) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.assert_queue(&QueueSpec::durable(name)).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_publish_deliver_ack() {
        let broker = broker_with_queue("q").await;
        assert!(broker.publish("q", b"one".to_vec(), properties("1")).await.unwrap());

        let delivery = broker
            .next_delivery("q", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body, b"one");
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked_count().await, 1);

        broker.ack(&delivery).await.unwrap();
        assert_eq!(broker.unacked_count().await, 0);
        assert!(matches!(
            broker.ack(&delivery).await,
            Err(CourierError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn test_nack_requeue_marks_redelivered() {
        let broker = broker_with_queue("q").await;
        broker.publish("q", b"m".to_vec(), properties("1")).await.unwrap();
        let first = broker.next_delivery("q", Duration::ZERO).await.unwrap().unwrap();
        broker.nack(&first, true).await.unwrap();

        let second = broker.next_delivery("q", Duration::ZERO).await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_ne!(first.tag, second.tag);
    }

    #[tokio::test]
    async fn test_returned_messages_are_never_refused_for_capacity() {
        let broker = InMemoryBroker::with_capacity(1);
        broker.assert_queue(&QueueSpec::durable("q")).await.unwrap();
        broker.publish("q", b"a".to_vec(), properties("a")).await.unwrap();
        let nacked = broker.next_delivery("q", Duration::ZERO).await.unwrap().unwrap();
        broker.publish("q", b"b".to_vec(), properties("b")).await.unwrap();

        broker.nack(&nacked, true).await.unwrap();
        assert_eq!(broker.queue_stats("q").await.unwrap().message_count, 2);

        let in_flight = broker.next_delivery("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(in_flight.body, b"a");
        assert!(!broker.publish("q", b"c".to_vec(), properties("c")).await.unwrap());
        broker.disconnect().await;
        broker.connect().await.unwrap();

        let mut bodies = Vec::new();
        while let Some(delivery) = broker.next_delivery("q", Duration::ZERO).await.unwrap() {
            bodies.push(delivery.body.clone());
            broker.ack(&delivery).await.unwrap();
        }
        assert_eq!(bodies, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn test_publish_to_missing_queue_is_an_error() {
        let broker = InMemoryBroker::new();
        let result = broker.publish("nope", Vec::new(), properties("1")).await;
        assert!(matches!(result, Err(CourierError::QueueNotFound(_))));
    }

    #[tokio::test]
    async fn test_full_queue_rejects_publish() {
        let broker = InMemoryBroker::with_capacity(1);
        broker.assert_queue(&QueueSpec::durable("q")).await.unwrap();
        assert!(broker.publish("q", Vec::new(), properties("1")).await.unwrap());
        assert!(!broker.publish("q", Vec::new(), properties("2")).await.unwrap());
    }

    #[tokio::test]
    async fn test_redeclare_with_different_settings_fails() {
        let broker = broker_with_queue("q").await;
        assert!(broker.assert_queue(&QueueSpec::durable("q")).await.is_ok());
        let conflicting = QueueSpec::durable("q").with_message_ttl(Duration::from_secs(1));
        assert!(matches!(
            broker.assert_queue(&conflicting).await,
            Err(CourierError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_requeues_unacked() {
        let broker = broker_with_queue("q").await;
        broker.publish("q", b"m".to_vec(), properties("1")).await.unwrap();
        let delivery = broker.next_delivery("q", Duration::ZERO).await.unwrap().unwrap();

        broker.disconnect().await;
        assert!(!broker.is_connected());
        assert!(matches!(
            broker.publish("q", Vec::new(), properties("2")).await,
            Err(CourierError::Connection(_))
        ));

        broker.connect().await.unwrap();
        assert!(matches!(
            broker.ack(&delivery).await,
            Err(CourierError::UnknownDelivery(_))
        ));
        let again = broker.next_delivery("q", Duration::ZERO).await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.properties.message_id, "1");
    }

    #[tokio::test]
    async fn test_fail_next_connects() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2);
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_messages_are_skipped() {
        let broker = InMemoryBroker::new();
        broker
            .assert_queue(&QueueSpec::durable("q").with_message_ttl(Duration::ZERO))
            .await
            .unwrap();
        broker.publish("q", b"stale".to_vec(), properties("1")).await.unwrap();

        let delivery = broker.next_delivery("q", Duration::ZERO).await.unwrap();
        assert!(delivery.is_none());
        assert_eq!(broker.queue_stats("q").await.unwrap().message_count, 0);
    }

    #[tokio::test]
    async fn test_consumer_count() {
        let broker = broker_with_queue("q").await;
        broker.register_consumer("q").await.unwrap();
        broker.register_consumer("q").await.unwrap();
        broker.unregister_consumer("q").await.unwrap();
        assert_eq!(broker.queue_stats("q").await.unwrap().consumer_count, 1);
    }

    #[tokio::test]
    async fn test_reset_clears_state() {
        let broker = broker_with_queue("q").await;
        broker
            .bind_queue(&QueueBinding::new("q", "ex", "q"))
            .await
            .unwrap();
        broker.reset().await;
        assert!(broker.bindings().await.is_empty());
        assert!(matches!(
            broker.queue_stats("q").await,
            Err(CourierError::QueueNotFound(_))
        ));
    }
}
