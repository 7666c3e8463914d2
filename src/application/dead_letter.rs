use crate::application::publisher::ReliableMessagePublisher;
use crate::domain::dead_letter::DeadLetterRecord;
use crate::domain::message::{Message, MessageProperties};
use crate::domain::ports::SharedBroker;
use crate::domain::topology::{QueueSpec, queues};
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;

/// Terminal store for messages that exhausted their retries.
///
/// Entry is one-way: nothing in this crate consumes the dead-letter queue
/// automatically. Operators drain it with [`DeadLetterSink::drain`].
/// Records are written through the publisher's channel so they serialize
/// with every other publish.
pub struct DeadLetterSink {
    broker: SharedBroker,
    publisher: Arc<ReliableMessagePublisher>,
    spec: QueueSpec,
}

impl DeadLetterSink {
    pub fn new(
        broker: SharedBroker,
        publisher: Arc<ReliableMessagePublisher>,
        message_ttl: Duration,
    ) -> Self {
        Self {
            broker,
            publisher,
            spec: QueueSpec::durable(queues::DEAD_LETTER).with_message_ttl(message_ttl),
        }
    }

    pub fn queue(&self) -> &str {
        &self.spec.name
    }

    /// Declares the dead-letter queue.
    pub async fn declare(&self) -> Result<()> {
        self.broker.assert_queue(&self.spec).await
    }

    /// Writes a dead-letter record for `message`. Returns whether the broker accepted it.
    pub async fn publish_to_dead_letter_queue(
        &self,
        original_queue: &str,
        message: &Message,
        error: &str,
    ) -> Result<bool> {
        let record = DeadLetterRecord::new(original_queue, message.envelope(), error);
        let body = serde_json::to_vec(&record)?;
        let properties = MessageProperties {
            message_id: message.idempotency_key.to_string(),
            persistent: true,
            priority: 0,
            expiration: None,
        };

        let accepted = self
            .publisher
            .publish_encoded(&self.spec.name, body, properties)
            .await?;
        if accepted {
            tracing::warn!(
                original_queue,
                idempotency_key = %message.idempotency_key,
                retry_count = message.retry_count,
                error,
                "message moved to dead-letter queue"
            );
        } else {
            tracing::error!(original_queue, idempotency_key = %message.idempotency_key, "dead-letter queue rejected message");
        }
        Ok(accepted)
    }

    /// Removes up to `limit` records from the dead-letter queue.
    pub async fn drain(&self, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        let mut records = Vec::new();
        while records.len() < limit {
            let Some(delivery) = self.broker.next_delivery(&self.spec.name, Duration::ZERO).await?
            else {
                break;
            };
            match serde_json::from_slice::<DeadLetterRecord>(&delivery.body) {
                Ok(record) => {
                    self.broker.ack(&delivery).await?;
                    records.push(record);
                }
                Err(e) => {
                    tracing::error!(tag = delivery.tag, error = %e, "unreadable dead-letter record left in place");
                    self.broker.nack(&delivery, true).await?;
                    break;
                }
            }
        }
        Ok(records)
    }
}
