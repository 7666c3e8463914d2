use courier::application::publisher::ReliableMessagePublisher;
use courier::domain::message::{MessageProperties, PublishOptions};
use courier::domain::ports::{BrokerBox, SharedBroker};
use courier::domain::topology::QueueSpec;
use courier::infrastructure::in_memory::InMemoryBroker;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn properties(id: &str) -> MessageProperties {
    MessageProperties {
        message_id: id.to_string(),
        persistent: true,
        priority: 0,
        expiration: None,
    }
}

#[tokio::test]
async fn test_broker_as_trait_object() {
    let broker: BrokerBox = Box::new(InMemoryBroker::new());

    // Verify Send + Sync by spawning a task
    let handle = tokio::spawn(async move {
        broker.assert_queue(&QueueSpec::durable("q")).await.unwrap();
        assert!(broker.publish("q", b"{}".to_vec(), properties("1")).await.unwrap());
        let delivery = broker.next_delivery("q", Duration::ZERO).await.unwrap().unwrap();
        broker.ack(&delivery).await.unwrap();
        broker.queue_stats("q").await.unwrap()
    });

    let stats = handle.await.unwrap();
    assert_eq!(stats.message_count, 0);
}

#[tokio::test]
async fn test_shared_broker_across_publishers() {
    let backend = InMemoryBroker::new();
    let shared: SharedBroker = Arc::new(backend.clone());
    let a = ReliableMessagePublisher::new(shared.clone(), Duration::from_secs(1));
    let b = ReliableMessagePublisher::new(shared.clone(), Duration::from_secs(1));

    let event = json!({"type": "payment.succeeded", "paymentId": "pm_1", "amount": 10});
    assert!(a.publish("payment.succeeded", &event, PublishOptions::default()).await.unwrap());
    assert!(b.publish("payment.succeeded", &event, PublishOptions::default()).await.unwrap());

    assert_eq!(shared.queue_stats("payment.succeeded").await.unwrap().message_count, 2);
}

#[cfg(feature = "storage-rocksdb")]
#[tokio::test]
async fn test_rocksdb_broker_as_trait_object() {
    use courier::infrastructure::rocksdb::RocksDbBroker;

    let dir = tempfile::tempdir().unwrap();
    let broker: BrokerBox = Box::new(RocksDbBroker::open(dir.path()).await.unwrap());
    let handle = tokio::spawn(async move {
        broker.assert_queue(&QueueSpec::durable("q")).await.unwrap();
        broker.publish("q", b"{}".to_vec(), properties("1")).await.unwrap();
        broker.queue_stats("q").await.unwrap()
    });
    assert_eq!(handle.await.unwrap().message_count, 1);
}
