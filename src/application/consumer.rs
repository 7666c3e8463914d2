use crate::application::dead_letter::DeadLetterSink;
use crate::application::dedup::Deduplicator;
use crate::application::publisher::ReliableMessagePublisher;
use crate::application::retry::{RetryDecision, RetryPolicy};
use crate::config::MessagingConfig;
use crate::domain::message::Message;
use crate::domain::ports::{Delivery, SharedBroker};
use crate::domain::topology::{QueueSpec, validate_queue_name};
use crate::error::{CourierError, Result};
use crate::sync::{AtomicCounter, ConcurrentMap, Mutex, Semaphore};
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// `Ok(true)` acks. `Ok(false)`, an error or a panic sends the message down the retry path.
pub type HandlerResult = std::result::Result<bool, BoxError>;

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: Message) -> HandlerResult {
        (self)(message).await
    }
}

#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub delivered: AtomicCounter,
    pub acked: AtomicCounter,
    /// Handler attempts that did not return `Ok(true)`.
    pub failures: AtomicCounter,
    pub retried: AtomicCounter,
    pub dead_lettered: AtomicCounter,
    pub duplicates: AtomicCounter,
    /// Deliveries whose body was not a valid envelope.
    pub rejected: AtomicCounter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerStatsSnapshot {
    pub delivered: i64,
    pub acked: i64,
    pub failures: i64,
    pub retried: i64,
    pub dead_lettered: i64,
    pub duplicates: i64,
    pub rejected: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Deliveries in flight at once, across all subscribed queues.
    pub prefetch: usize,
    pub poll_interval: Duration,
    /// `None` disables deduplication.
    pub dedup_ttl: Option<Duration>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self::from_config(&MessagingConfig::default())
    }
}

impl ConsumerOptions {
    pub fn from_config(config: &MessagingConfig) -> Self {
        Self {
            prefetch: config.prefetch,
            poll_interval: config.poll_interval(),
            dedup_ttl: config.dedup_ttl(),
        }
    }
}

struct ConsumerCore {
    broker: SharedBroker,
    publisher: Arc<ReliableMessagePublisher>,
    dead_letters: Arc<DeadLetterSink>,
    policy: RetryPolicy,
    dedup: Option<Arc<Deduplicator>>,
    stats: ConsumerStats,
    in_flight: Semaphore,
    poll_interval: Duration,
    shutdown: watch::Sender<bool>,
}

/// Pulls deliveries from subscribed queues and settles each one exactly once.
///
/// A failed attempt is republished to the same queue with `retryCount + 1`
/// after an exponential backoff, and the original delivery is acked only once
/// the copy is accepted. The backoff runs while the original is still unacked,
/// so a crash during it leaves the message on the broker. Once the retry budget
/// is spent the message goes to the dead-letter queue instead.
pub struct ReliableMessageConsumer {
    core: Arc<ConsumerCore>,
    handlers: ConcurrentMap<String, Arc<dyn MessageHandler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReliableMessageConsumer {
    pub fn new(
        broker: SharedBroker,
        publisher: Arc<ReliableMessagePublisher>,
        dead_letters: Arc<DeadLetterSink>,
        policy: RetryPolicy,
        options: ConsumerOptions,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            core: Arc::new(ConsumerCore {
                broker,
                publisher,
                dead_letters,
                policy,
                dedup: options.dedup_ttl.map(|ttl| Arc::new(Deduplicator::new(ttl))),
                stats: ConsumerStats::default(),
                in_flight: Semaphore::new(options.prefetch.max(1)),
                poll_interval: options.poll_interval,
                shutdown,
            }),
            handlers: ConcurrentMap::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Declares `queue` as durable, registers `handler` for it and starts consuming.
    ///
    /// A queue takes one handler; subscribing twice is a configuration error.
    pub async fn subscribe<H>(&self, queue: &str, handler: H) -> Result<()>
    where
        H: MessageHandler + 'static,
    {
        validate_queue_name(queue)?;
        if self.core.in_flight.is_drained() {
            return Err(CourierError::Consume("consumer has been shut down".to_string()));
        }

        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        if !self.handlers.set_if_absent(queue.to_string(), handler.clone()).await {
            return Err(CourierError::Config(format!(
                "queue '{queue}' already has a handler"
            )));
        }
        if let Err(e) = self.attach(queue).await {
            self.handlers.delete(&queue.to_string()).await;
            return Err(e);
        }

        let span = tracing::info_span!("consumer", queue);
        let task = tokio::spawn(
            self.core
                .clone()
                .run(queue.to_string(), handler)
                .instrument(span),
        );
        let mut tasks = self.tasks.lock().await;
        if tasks.is_empty() {
            if let Some(dedup) = &self.core.dedup {
                let sweeper = dedup
                    .clone()
                    .spawn_sweeper(dedup.ttl(), self.core.shutdown.subscribe());
                tasks.push(sweeper);
            }
        }
        tasks.push(task);
        drop(tasks);
        tracing::info!(queue, "subscribed");
        Ok(())
    }

    async fn attach(&self, queue: &str) -> Result<()> {
        self.core.broker.assert_queue(&QueueSpec::durable(queue)).await?;
        self.core.broker.register_consumer(queue).await
    }

    pub async fn subscribed_queues(&self) -> Vec<String> {
        self.handlers.keys().await
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        let stats = &self.core.stats;
        ConsumerStatsSnapshot {
            delivered: stats.delivered.get(),
            acked: stats.acked.get(),
            failures: stats.failures.get(),
            retried: stats.retried.get(),
            dead_lettered: stats.dead_lettered.get(),
            duplicates: stats.duplicates.get(),
            rejected: stats.rejected.get(),
        }
    }

    /// Stops pulling, waits for in-flight deliveries to settle and deregisters.
    ///
    /// A delivery still backing off is nacked back onto its queue. Calling
    /// this more than once is a no-op.
    pub async fn shutdown(&self) {
        if self.core.shutdown.send_replace(true) {
            return;
        }
        let waiters = self.core.in_flight.drain();
        tracing::info!(waiters, "consumer shutting down");

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "consumer task failed");
            }
        }
        for queue in self.handlers.keys().await {
            if let Err(e) = self.core.broker.unregister_consumer(&queue).await {
                tracing::debug!(queue = %queue, error = %e, "could not deregister consumer");
            }
        }
        tracing::info!("consumer stopped");
    }
}

impl ConsumerCore {
    async fn run(self: Arc<Self>, queue: String, handler: Arc<dyn MessageHandler>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut workers = JoinSet::new();

        loop {
            while workers.try_join_next().is_some() {}
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = self.in_flight.acquire(None) => match permit {
                    Some(permit) => permit,
                    None => break,
                },
            };

            match self.broker.next_delivery(&queue, self.poll_interval).await {
                Ok(Some(delivery)) => {
                    if *shutdown.borrow() {
                        self.nack(&delivery, true).await;
                        break;
                    }
                    let core = self.clone();
                    let handler = handler.clone();
                    workers.spawn(
                        async move {
                            core.process(delivery, handler).await;
                            permit.release();
                        }
                        .in_current_span(),
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    drop(permit);
                    tracing::warn!(error = %e, "receive failed");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "delivery worker failed");
            }
        }
        tracing::debug!("consumer loop exited");
    }

    async fn process(&self, delivery: Delivery, handler: Arc<dyn MessageHandler>) {
        self.stats.delivered.increment();
        let message = match Message::from_wire(&delivery.queue, &delivery.body, &delivery.properties)
        {
            Ok(message) => message,
            Err(e) => {
                self.stats.rejected.increment();
                tracing::error!(tag = delivery.tag, error = %e, "rejecting undecodable delivery");
                self.nack(&delivery, false).await;
                return;
            }
        };

        let span = tracing::info_span!(
            "delivery",
            tag = delivery.tag,
            idempotency_key = %message.idempotency_key,
            retry_count = message.retry_count,
            redelivered = delivery.redelivered
        );
        self.settle(delivery, message, handler).instrument(span).await;
    }

    async fn settle(&self, delivery: Delivery, message: Message, handler: Arc<dyn MessageHandler>) {
        if let Some(dedup) = &self.dedup {
            if dedup.is_processed(&message.idempotency_key).await {
                self.stats.duplicates.increment();
                tracing::debug!("duplicate delivery acked without handling");
                self.ack(&delivery).await;
                return;
            }
        }

        let attempt = {
            let message = message.clone();
            tokio::spawn(async move { handler.handle(message).await }).await
        };
        let error = match attempt {
            Ok(Ok(true)) => {
                if self.ack(&delivery).await {
                    self.stats.acked.increment();
                    if let Some(dedup) = &self.dedup {
                        dedup.mark_processed(message.idempotency_key.clone()).await;
                    }
                    tracing::debug!("message handled");
                }
                return;
            }
            Ok(Ok(false)) => "handler returned false".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(e) if e.is_panic() => "handler panicked".to_string(),
            Err(e) => e.to_string(),
        };

        self.stats.failures.increment();
        self.retry_or_dead_letter(delivery, message, error).await;
    }

    async fn retry_or_dead_letter(&self, delivery: Delivery, message: Message, error: String) {
        let next = message.next_attempt();
        match self.policy.decide(next.retry_count) {
            RetryDecision::Retry(delay) => {
                tracing::info!(error = %error, next_retry = next.retry_count, ?delay, "handler failed, scheduling retry");
                if !self.hold(&delivery, delay).await {
                    return;
                }

                match self.publisher.republish(&next).await {
                    Ok(true) => {
                        self.stats.retried.increment();
                        self.ack(&delivery).await;
                    }
                    Ok(false) => {
                        // The original goes back with its attempt unchanged and is handled again.
                        tracing::warn!("retry not accepted by broker, requeueing original");
                        self.nack(&delivery, true).await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "retry publish failed, requeueing original");
                        self.nack(&delivery, true).await;
                    }
                }
            }
            RetryDecision::DeadLetter => {
                match self
                    .dead_letters
                    .publish_to_dead_letter_queue(&delivery.queue, &message, &error)
                    .await
                {
                    Ok(true) => {
                        self.stats.dead_lettered.increment();
                        self.ack(&delivery).await;
                    }
                    Ok(false) => {
                        tracing::warn!("dead-letter record not accepted, requeueing original");
                        if self.hold(&delivery, self.policy.base_delay).await {
                            self.nack(&delivery, true).await;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "dead-letter write failed, requeueing original");
                        if self.hold(&delivery, self.policy.base_delay).await {
                            self.nack(&delivery, true).await;
                        }
                    }
                }
            }
        }
    }

    /// Keeps `delivery` unacked for `delay`. Returns `false` if shutdown cut
    /// the wait short, in which case the delivery has already been requeued.
    async fn hold(&self, delivery: &Delivery, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.subscribe();
        let stopping = async move {
            let _ = shutdown.wait_for(|stopping| *stopping).await;
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = stopping => {
                tracing::info!("shutdown during backoff, returning message to queue");
                self.nack(delivery, true).await;
                false
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> bool {
        match self.broker.ack(delivery).await {
            Ok(()) => true,
            Err(e) => {
                // The broker redelivers it; at-least-once still holds.
                tracing::warn!(tag = delivery.tag, error = %e, "ack failed");
                false
            }
        }
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) {
        if let Err(e) = self.broker.nack(delivery, requeue).await {
            tracing::warn!(tag = delivery.tag, requeue, error = %e, "nack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::PublishOptions;
    use crate::domain::ports::Broker;
    use crate::infrastructure::in_memory::InMemoryBroker;
    use serde_json::json;

    struct Fixture {
        broker: InMemoryBroker,
        publisher: Arc<ReliableMessagePublisher>,
        consumer: ReliableMessageConsumer,
    }

    async fn fixture(max_retries: u32) -> Fixture {
        let broker = InMemoryBroker::new();
        let shared: SharedBroker = Arc::new(broker.clone());
        let publisher = Arc::new(ReliableMessagePublisher::new(
            shared.clone(),
            Duration::from_secs(5),
        ));
        let dead_letters = Arc::new(DeadLetterSink::new(
            shared.clone(),
            publisher.clone(),
            Duration::from_secs(3600),
        ));
        dead_letters.declare().await.unwrap();
        let consumer = ReliableMessageConsumer::new(
            shared,
            publisher.clone(),
            dead_letters,
            RetryPolicy::new(max_retries, Duration::from_millis(100)),
            ConsumerOptions {
                prefetch: 4,
                poll_interval: Duration::from_millis(20),
                dedup_ttl: Some(Duration::from_secs(60)),
            },
        );
        Fixture {
            broker,
            publisher,
            consumer,
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..1_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_acks() {
        let f = fixture(3).await;
        f.consumer
            .subscribe("q", |_message: Message| async { Ok::<_, BoxError>(true) })
            .await
            .unwrap();
        f.publisher
            .publish("q", &json!({"type": "t"}), PublishOptions::default())
            .await
            .unwrap();

        wait_until(|| f.consumer.stats().acked == 1).await;
        assert_eq!(f.broker.queue_stats("q").await.unwrap().message_count, 0);
        assert_eq!(f.broker.unacked_count().await, 0);
        f.consumer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_and_panics_count_as_failures() {
        let f = fixture(1).await;
        f.consumer
            .subscribe("q", |message: Message| async move {
                if message.retry_count == 0 {
                    Err::<bool, BoxError>("boom".into())
                } else {
                    panic!("handler blew up")
                }
            })
            .await
            .unwrap();
        f.publisher
            .publish("q", &json!({"type": "t"}), PublishOptions::default())
            .await
            .unwrap();

        wait_until(|| f.consumer.stats().dead_lettered == 1).await;
        let stats = f.consumer.stats();
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.retried, 1);
        f.consumer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_delivery_is_rejected() {
        let f = fixture(3).await;
        f.broker.assert_queue(&QueueSpec::durable("q")).await.unwrap();
        f.broker
            .publish(
                "q",
                b"not json".to_vec(),
                crate::domain::message::MessageProperties {
                    message_id: "m".to_string(),
                    persistent: true,
                    priority: 0,
                    expiration: None,
                },
            )
            .await
            .unwrap();
        f.consumer
            .subscribe("q", |_message: Message| async { Ok::<_, BoxError>(true) })
            .await
            .unwrap();

        wait_until(|| f.consumer.stats().rejected == 1).await;
        assert_eq!(f.broker.queue_stats("q").await.unwrap().message_count, 0);
        assert_eq!(f.broker.queue_stats("dlq").await.unwrap().message_count, 0);
        f.consumer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_key_is_acked_without_handling() {
        let f = fixture(3).await;
        let calls = Arc::new(AtomicCounter::default());
        let seen = calls.clone();
        f.consumer
            .subscribe("q", move |_message: Message| {
                let seen = seen.clone();
                async move {
                    seen.increment();
                    Ok::<_, BoxError>(true)
                }
            })
            .await
            .unwrap();

        f.publisher
            .publish("q", &json!({"type": "t"}), PublishOptions::default())
            .await
            .unwrap();
        wait_until(|| f.consumer.stats().acked == 1).await;

        // The same logical event arrives twice.
        let message = Message::from_event(
            "q",
            &json!({"type": "t"}),
            crate::domain::message::IdempotencyKey::new("fixed-key").unwrap(),
            &PublishOptions::default(),
        )
        .unwrap();
        f.publisher.republish(&message).await.unwrap();
        wait_until(|| f.consumer.stats().acked == 2).await;
        f.publisher.republish(&message).await.unwrap();

        wait_until(|| f.consumer.stats().duplicates == 1).await;
        assert_eq!(calls.get(), 2);
        f.consumer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_processed_keys_are_swept_after_ttl() {
        let f = fixture(3).await;
        f.consumer
            .subscribe("q", |_message: Message| async { Ok::<_, BoxError>(true) })
            .await
            .unwrap();
        for _ in 0..3 {
            f.publisher
                .publish("q", &json!({"type": "t"}), PublishOptions::default())
                .await
                .unwrap();
        }
        wait_until(|| f.consumer.stats().acked == 3).await;

        let dedup = f.consumer.core.dedup.clone().unwrap();
        assert_eq!(dedup.len().await, 3);
        tokio::time::sleep(Duration::from_secs(125)).await;
        assert!(dedup.is_empty().await);

        // Returns only once the sweeper has stopped too.
        f.consumer.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_twice_is_rejected() {
        let f = fixture(3).await;
        f.consumer
            .subscribe("q", |_message: Message| async { Ok::<_, BoxError>(true) })
            .await
            .unwrap();
        let second = f
            .consumer
            .subscribe("q", |_message: Message| async { Ok::<_, BoxError>(true) })
            .await;
        assert!(matches!(second, Err(CourierError::Config(_))));
        assert_eq!(f.broker.queue_stats("q").await.unwrap().consumer_count, 1);

        f.consumer.shutdown().await;
        assert_eq!(f.broker.queue_stats("q").await.unwrap().consumer_count, 0);
        let after = f
            .consumer
            .subscribe("other", |_message: Message| async { Ok::<_, BoxError>(true) })
            .await;
        assert!(matches!(after, Err(CourierError::Consume(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff_requeues_original() {
        let f = fixture(3).await;
        f.consumer
            .subscribe("q", |_message: Message| async { Ok::<_, BoxError>(false) })
            .await
            .unwrap();
        f.publisher
            .publish("q", &json!({"type": "t"}), PublishOptions::default())
            .await
            .unwrap();

        wait_until(|| f.consumer.stats().failures == 1).await;
        f.consumer.shutdown().await;

        let stats = f.broker.queue_stats("q").await.unwrap();
        assert_eq!(stats.message_count, 1);
        assert_eq!(f.broker.unacked_count().await, 0);
        let delivery = f.broker.next_delivery("q", Duration::ZERO).await.unwrap().unwrap();
        assert!(delivery.redelivered);
    }
}
