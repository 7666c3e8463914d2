use crate::application::connection::ConnectionManager;
use crate::application::consumer::{ConsumerOptions, ReliableMessageConsumer};
use crate::application::dead_letter::DeadLetterSink;
use crate::application::publisher::ReliableMessagePublisher;
use crate::application::retry::RetryPolicy;
use crate::config::MessagingConfig;
use crate::domain::ports::{QueueStats, SharedBroker};
use crate::domain::topology::{EVENTS_EXCHANGE, Topology};
use crate::error::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub message: String,
}

/// Wires the messaging components over one broker and exposes the operational surface.
pub struct MessagingService {
    broker: SharedBroker,
    connection: Arc<ConnectionManager>,
    publisher: Arc<ReliableMessagePublisher>,
    consumer: ReliableMessageConsumer,
    dead_letters: Arc<DeadLetterSink>,
    shutdown: watch::Sender<bool>,
    watchdog: JoinHandle<()>,
}

impl MessagingService {
    /// Connects, declares the standard topology and starts the connection watchdog.
    pub async fn start(broker: SharedBroker, config: &MessagingConfig) -> Result<Self> {
        config.validate()?;
        let connection = Arc::new(ConnectionManager::from_config(broker.clone(), config));
        connection.establish().await?;

        let topology = Topology::standard(config.dead_letter_ttl());
        for queue in &topology.queues {
            broker.assert_queue(queue).await?;
        }
        for binding in &topology.bindings {
            broker.bind_queue(binding).await?;
        }
        tracing::info!(
            queues = topology.queues.len(),
            bindings = topology.bindings.len(),
            exchange = EVENTS_EXCHANGE,
            "topology declared"
        );

        let publisher = Arc::new(ReliableMessagePublisher::new(
            broker.clone(),
            config.publish_lock_timeout(),
        ));
        let dead_letters = Arc::new(DeadLetterSink::new(
            broker.clone(),
            publisher.clone(),
            config.dead_letter_ttl(),
        ));
        let consumer = ReliableMessageConsumer::new(
            broker.clone(),
            publisher.clone(),
            dead_letters.clone(),
            RetryPolicy::from_config(config),
            ConsumerOptions::from_config(config),
        );

        let (shutdown, stopped) = watch::channel(false);
        let watchdog = connection
            .clone()
            .spawn_watchdog(config.reconnect_delay(), stopped);

        Ok(Self {
            broker,
            connection,
            publisher,
            consumer,
            dead_letters,
            shutdown,
            watchdog,
        })
    }

    pub fn publisher(&self) -> Arc<ReliableMessagePublisher> {
        self.publisher.clone()
    }

    pub fn consumer(&self) -> &ReliableMessageConsumer {
        &self.consumer
    }

    pub fn dead_letters(&self) -> Arc<DeadLetterSink> {
        self.dead_letters.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub async fn get_queue_stats(&self, queue: &str) -> Result<QueueStats> {
        self.broker.queue_stats(queue).await
    }

    pub async fn health_check(&self) -> HealthReport {
        if !self.is_connected() {
            return HealthReport {
                status: HealthStatus::Unhealthy,
                message: "broker connection is down".to_string(),
            };
        }
        match self.broker.queue_stats(self.dead_letters.queue()).await {
            Ok(stats) => HealthReport {
                status: HealthStatus::Healthy,
                message: format!(
                    "connected; {} message(s) in dead-letter queue",
                    stats.message_count
                ),
            },
            Err(e) => HealthReport {
                status: HealthStatus::Unhealthy,
                message: e.to_string(),
            },
        }
    }

    /// Stops the consumer and the watchdog, then closes the broker connection.
    pub async fn shutdown(self) -> Result<()> {
        self.consumer.shutdown().await;
        self.shutdown.send_replace(true);
        if let Err(e) = self.watchdog.await {
            tracing::error!(error = %e, "connection watchdog failed");
        }
        self.broker.close().await?;
        tracing::info!("messaging service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::PublishOptions;
    use crate::domain::ports::Broker;
    use crate::domain::topology::queues;
    use crate::infrastructure::in_memory::InMemoryBroker;
    use serde_json::json;

    #[tokio::test]
    async fn test_start_declares_standard_topology() {
        let broker = InMemoryBroker::new();
        let service = MessagingService::start(Arc::new(broker.clone()), &MessagingConfig::default())
            .await
            .unwrap();

        for queue in queues::EVENT_QUEUES {
            assert_eq!(service.get_queue_stats(queue).await.unwrap().message_count, 0);
        }
        assert!(service.get_queue_stats(queues::DEAD_LETTER).await.is_ok());
        assert_eq!(broker.bindings().await.len(), queues::EVENT_QUEUES.len());

        let report = service.health_check().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        service.shutdown().await.unwrap();
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn test_health_reports_lost_connection() {
        let broker = InMemoryBroker::new();
        let mut config = MessagingConfig::default();
        config.reconnect_delay_ms = 60_000;
        let service = MessagingService::start(Arc::new(broker.clone()), &config)
            .await
            .unwrap();

        broker.disconnect().await;
        assert!(!service.is_connected());
        let report = service.health_check().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(
            serde_json::to_value(&report).unwrap()["status"],
            json!("unhealthy")
        );
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_when_broker_stays_down() {
        let broker = InMemoryBroker::new();
        broker.disconnect().await;
        broker.fail_next_connects(100);
        let mut config = MessagingConfig::default();
        config.reconnect_attempts = 2;
        config.reconnect_delay_ms = 1;

        let result = MessagingService::start(Arc::new(broker), &config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_publish_through_service() {
        let broker = InMemoryBroker::new();
        let service = MessagingService::start(Arc::new(broker), &MessagingConfig::default())
            .await
            .unwrap();
        let accepted = service
            .publisher()
            .publish(
                queues::BALANCE_UPDATED,
                &json!({"type": "balance.updated", "userId": "u_1", "balance": 10}),
                PublishOptions::default(),
            )
            .await
            .unwrap();
        assert!(accepted);
        assert_eq!(
            service
                .get_queue_stats(queues::BALANCE_UPDATED)
                .await
                .unwrap()
                .message_count,
            1
        );
        service.shutdown().await.unwrap();
    }
}
