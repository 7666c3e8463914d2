#![allow(dead_code)]

use courier::application::consumer::{ConsumerOptions, ReliableMessageConsumer};
use courier::application::dead_letter::DeadLetterSink;
use courier::application::publisher::ReliableMessagePublisher;
use courier::application::retry::RetryPolicy;
use courier::domain::ports::SharedBroker;
use courier::infrastructure::in_memory::InMemoryBroker;
use std::sync::Arc;
use std::time::Duration;

/// Publisher, consumer and dead-letter sink over one in-memory broker.
pub struct Harness {
    pub broker: InMemoryBroker,
    pub publisher: Arc<ReliableMessagePublisher>,
    pub dead_letters: Arc<DeadLetterSink>,
    pub consumer: ReliableMessageConsumer,
}

pub async fn harness(max_retries: u32, base_delay: Duration) -> Harness {
    harness_with(InMemoryBroker::new(), max_retries, base_delay, 8).await
}

/// Like [`harness`] over a caller-built broker and prefetch.
pub async fn harness_with(
    broker: InMemoryBroker,
    max_retries: u32,
    base_delay: Duration,
    prefetch: usize,
) -> Harness {
    let shared: SharedBroker = Arc::new(broker.clone());
    let publisher = Arc::new(ReliableMessagePublisher::new(
        shared.clone(),
        Duration::from_secs(5),
    ));
    let dead_letters = Arc::new(DeadLetterSink::new(
        shared.clone(),
        publisher.clone(),
        Duration::from_secs(86_400),
    ));
    dead_letters.declare().await.unwrap();
    let consumer = ReliableMessageConsumer::new(
        shared,
        publisher.clone(),
        dead_letters.clone(),
        RetryPolicy::new(max_retries, base_delay),
        ConsumerOptions {
            prefetch,
            poll_interval: Duration::from_millis(50),
            dedup_ttl: None,
        },
    );
    Harness {
        broker,
        publisher,
        dead_letters,
        consumer,
    }
}

/// Polls `condition` every 10ms (virtual time under `start_paused`).
pub async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
