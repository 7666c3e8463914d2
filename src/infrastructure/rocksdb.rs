use super::StoredMessage;
use super::in_memory::DEFAULT_QUEUE_CAPACITY;
use crate::domain::message::MessageProperties;
use crate::domain::ports::{Broker, Delivery, DeliveryTag, QueueStats};
use crate::domain::topology::{QueueBinding, QueueSpec, validate_queue_name};
use crate::error::{CourierError, Result};
use crate::sync::{AtomicCounter, ConcurrentMap, ConcurrentQueue};
use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteOptions};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Column Family for queue declarations, keyed by queue name.
pub const CF_QUEUES: &str = "queues";
/// Column Family for ready and unacked messages, keyed by `queue \0 sequence`.
pub const CF_MESSAGES: &str = "messages";

struct QueueState {
    spec: QueueSpec,
    /// Sequence numbers of messages waiting for a consumer, in publish order.
    ready: ConcurrentQueue<u64>,
    consumers: AtomicCounter,
}

#[derive(Clone)]
struct Unacked {
    queue: String,
    sequence: u64,
}

struct Inner {
    db: DB,
    queues: ConcurrentMap<String, Arc<QueueState>>,
    bindings: RwLock<Vec<QueueBinding>>,
    unacked: ConcurrentMap<DeliveryTag, Unacked>,
    next_sequence: AtomicCounter,
    next_tag: AtomicCounter,
    connected: AtomicBool,
    queue_capacity: usize,
}

/// A broker whose queues survive restarts.
///
/// Every message stays in RocksDB until it is acked, so anything in flight
/// when the process stops is ready again after [`RocksDbBroker::open`].
/// Persistent messages are written with a synced write.
///
/// `Clone` shares the underlying database handle.
#[derive(Clone)]
pub struct RocksDbBroker {
    inner: Arc<Inner>,
}

fn message_key(queue: &str, sequence: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(queue.len() + 9);
    key.extend_from_slice(queue.as_bytes());
    key.push(0);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

fn split_message_key(key: &[u8]) -> Option<(&str, u64)> {
    let separator = key.len().checked_sub(9)?;
    if key[separator] != 0 {
        return None;
    }
    let queue = std::str::from_utf8(&key[..separator]).ok()?;
    let sequence = u64::from_be_bytes(key[separator + 1..].try_into().ok()?);
    Some((queue, sequence))
}

fn missing_cf(name: &str) -> CourierError {
    CourierError::Io(std::io::Error::other(format!(
        "{name} column family not found"
    )))
}

impl RocksDbBroker {
    /// Opens or creates a database at `path` and reloads its queues.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_capacity(path, DEFAULT_QUEUE_CAPACITY).await
    }

    pub async fn open_with_capacity<P: AsRef<Path>>(path: P, queue_capacity: usize) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_queues = ColumnFamilyDescriptor::new(CF_QUEUES, Options::default());
        let cf_messages = ColumnFamilyDescriptor::new(CF_MESSAGES, Options::default());
        let db = DB::open_cf_descriptors(&opts, path, vec![cf_queues, cf_messages])?;

        let broker = Self {
            inner: Arc::new(Inner {
                db,
                queues: ConcurrentMap::new(),
                bindings: RwLock::new(Vec::new()),
                unacked: ConcurrentMap::new(),
                next_sequence: AtomicCounter::default(),
                next_tag: AtomicCounter::default(),
                connected: AtomicBool::new(true),
                queue_capacity,
            }),
        };
        broker.recover().await?;
        Ok(broker)
    }

    async fn recover(&self) -> Result<()> {
        let db = &self.inner.db;

        let mut specs = Vec::new();
        for item in db.iterator_cf(self.cf(CF_QUEUES)?, IteratorMode::Start) {
            let (_key, value) = item?;
            specs.push(serde_json::from_slice::<QueueSpec>(&value)?);
        }
        for spec in specs {
            self.inner
                .queues
                .set(spec.name.clone(), Arc::new(self.queue_state(spec)))
                .await;
        }

        // Keys sort by queue, then by sequence, so each queue refills in publish order.
        let mut max_sequence = 0u64;
        let mut restored: HashMap<String, usize> = HashMap::new();
        let mut pending = Vec::new();
        for item in db.iterator_cf(self.cf(CF_MESSAGES)?, IteratorMode::Start) {
            let (key, _value) = item?;
            let Some((queue, sequence)) = split_message_key(&key) else {
                tracing::warn!(key = ?key, "skipping malformed message key");
                continue;
            };
            max_sequence = max_sequence.max(sequence);
            pending.push((queue.to_string(), sequence));
        }
        for (queue, sequence) in pending {
            let Ok(state) = self.queue(&queue).await else {
                tracing::warn!(queue = %queue, sequence, "message for undeclared queue left in place");
                continue;
            };
            if state.ready.enqueue(sequence).await {
                *restored.entry(queue).or_default() += 1;
            } else {
                tracing::warn!(queue = %queue, sequence, "queue over capacity on reopen, message not restored");
            }
        }

        self.inner
            .next_sequence
            .set(i64::try_from(max_sequence).unwrap_or(i64::MAX));
        for (queue, count) in restored {
            tracing::info!(queue = %queue, count, "restored persisted messages");
        }
        Ok(())
    }

    fn queue_state(&self, spec: QueueSpec) -> QueueState {
        QueueState {
            spec,
            ready: ConcurrentQueue::new(self.inner.queue_capacity),
            consumers: AtomicCounter::default(),
        }
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.inner.db.cf_handle(name).ok_or_else(|| missing_cf(name))
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(CourierError::Connection("rocksdb broker is closed".to_string()))
        }
    }

    async fn queue(&self, name: &str) -> Result<Arc<QueueState>> {
        self.inner
            .queues
            .get(&name.to_string())
            .await
            .ok_or_else(|| CourierError::QueueNotFound(name.to_string()))
    }

    fn load(&self, queue: &str, sequence: u64) -> Result<Option<StoredMessage>> {
        let bytes = self
            .inner
            .db
            .get_cf(self.cf(CF_MESSAGES)?, message_key(queue, sequence))?;
        bytes
            .map(|bytes| serde_json::from_slice(&bytes).map_err(CourierError::from))
            .transpose()
    }

    fn store(&self, queue: &str, sequence: u64, message: &StoredMessage) -> Result<()> {
        let mut write_options = WriteOptions::default();
        write_options.set_sync(message.properties.persistent);
        self.inner.db.put_cf_opt(
            self.cf(CF_MESSAGES)?,
            message_key(queue, sequence),
            serde_json::to_vec(message)?,
            &write_options,
        )?;
        Ok(())
    }

    fn remove(&self, queue: &str, sequence: u64) -> Result<()> {
        self.inner
            .db
            .delete_cf(self.cf(CF_MESSAGES)?, message_key(queue, sequence))?;
        Ok(())
    }

    /// Marks the broker closed. Unacked deliveries go back to their queues.
    pub async fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        for (tag, _) in self.inner.unacked.snapshot().await {
            let Some(unacked) = self.inner.unacked.delete(&tag).await else {
                continue;
            };
            if let Err(e) = self.return_to_queue(&unacked).await {
                tracing::warn!(queue = %unacked.queue, tag, error = %e, "could not requeue unacked message");
            }
        }
    }

    async fn return_to_queue(&self, unacked: &Unacked) -> Result<()> {
        let state = self.queue(&unacked.queue).await?;
        // The row is still stored, so the sequence goes back even if the flag update fails.
        state.ready.requeue_front(unacked.sequence).await;
        if let Some(mut message) = self.load(&unacked.queue, unacked.sequence)? {
            message.redelivered = true;
            self.store(&unacked.queue, unacked.sequence, &message)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for RocksDbBroker {
    async fn connect(&self) -> Result<()> {
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.disconnect().await;
        self.inner.db.flush_cf(self.cf(CF_MESSAGES)?)?;
        Ok(())
    }

    async fn assert_queue(&self, spec: &QueueSpec) -> Result<()> {
        validate_queue_name(&spec.name)?;
        self.ensure_connected()?;

        if let Ok(existing) = self.queue(&spec.name).await {
            return if existing.spec == *spec {
                Ok(())
            } else {
                Err(CourierError::Config(format!(
                    "queue '{}' already declared with different settings",
                    spec.name
                )))
            };
        }

        let state = Arc::new(self.queue_state(spec.clone()));
        if self.inner.queues.set_if_absent(spec.name.clone(), state).await {
            self.inner.db.put_cf(
                self.cf(CF_QUEUES)?,
                spec.name.as_bytes(),
                serde_json::to_vec(spec)?,
            )?;
            tracing::debug!(queue = %spec.name, "queue declared");
        }
        Ok(())
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
        if state.ready.size().await >= state.ready.max_size() {
            return Ok(false);
        }

        let sequence = self.inner.next_sequence.increment() as u64;
        self.store(queue, sequence, &StoredMessage::new(body, properties))?;
        if state.ready.enqueue(sequence).await {
            Ok(true)
        } else {
            self.remove(queue, sequence)?;
            Ok(false)
        }
    }

    async fn next_delivery(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>> {
        self.ensure_connected()?;
        let state = self.queue(queue).await?;
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(sequence) = state.ready.dequeue_blocking(Some(remaining)).await else {
                return Ok(None);
            };
            if !self.is_connected() {
                state.ready.requeue_front(sequence).await;
                return Err(CourierError::Connection("rocksdb broker is closed".to_string()));
            }
            let Some(message) = self.load(queue, sequence)? else {
                continue;
            };
            if message.is_expired(state.spec.message_ttl_ms, Utc::now().timestamp_millis()) {
                tracing::debug!(queue, message_id = %message.properties.message_id, "discarding expired message");
                self.remove(queue, sequence)?;
                continue;
            }

            let tag = self.inner.next_tag.increment() as DeliveryTag;
            self.inner
                .unacked
                .set(
                    tag,
                    Unacked {
                        queue: queue.to_string(),
                        sequence,
                    },
                )
                .await;
            return Ok(Some(Delivery {
                tag,
                queue: queue.to_string(),
                body: message.body,
                properties: message.properties,
                redelivered: message.redelivered,
            }));
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.ensure_connected()?;
        let unacked = self
            .inner
            .unacked
            .delete(&delivery.tag)
            .await
            .ok_or(CourierError::UnknownDelivery(delivery.tag))?;
        self.remove(&unacked.queue, unacked.sequence)
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.ensure_connected()?;
        let unacked = self
            .inner
            .unacked
            .delete(&delivery.tag)
            .await
            .ok_or(CourierError::UnknownDelivery(delivery.tag))?;
        if requeue {
            self.return_to_queue(&unacked).await
        } else {
            self.remove(&unacked.queue, unacked.sequence)
        }
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
