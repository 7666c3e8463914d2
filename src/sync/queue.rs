use super::bounded;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

/// Bounded FIFO queue.
///
/// `enqueue` never blocks: a full queue rejects the item so the caller sees
/// backpressure. Consumers either poll with `dequeue` or suspend in
/// `dequeue_blocking`.
#[derive(Debug)]
pub struct ConcurrentQueue<T> {
    items: Mutex<VecDeque<T>>,
    // One permit per queued item.
    ready: Semaphore,
    max_size: usize,
}

impl<T> ConcurrentQueue<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Semaphore::new(0),
            max_size,
        }
    }

    /// Appends `item`, or hands it back when the queue is full.
    pub async fn try_enqueue(&self, item: T) -> Result<(), T> {
        {
            let mut items = self.items.lock().await;
            if items.len() >= self.max_size {
                return Err(item);
            }
            items.push_back(item);
        }
        self.ready.add_permits(1);
        Ok(())
    }

    /// Appends `item`. Returns `false` when the queue is full.
    pub async fn enqueue(&self, item: T) -> bool {
        self.try_enqueue(item).await.is_ok()
    }

    /// Puts `item` back at the head so it is the next one dequeued.
    ///
    /// Only for items previously taken off this queue. They were admitted
    /// once already, so `max_size` is not checked again and the queue may
    /// briefly hold more than `max_size` items.
    pub async fn requeue_front(&self, item: T) {
        self.items.lock().await.push_front(item);
        self.ready.add_permits(1);
    }

    /// Removes the head item without waiting.
    pub async fn dequeue(&self) -> Option<T> {
        let permit = self.ready.try_acquire().ok()?;
        permit.forget();
        self.items.lock().await.pop_front()
    }

    /// Waits for an item until `timeout` elapses.
    pub async fn dequeue_blocking(&self, timeout: Option<Duration>) -> Option<T> {
        let permit = bounded(self.ready.acquire(), timeout).await?.ok()?;
        permit.forget();
        self.items.lock().await.pop_front()
    }

    pub async fn size(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Removes and returns every queued item.
    pub async fn drain(&self) -> Vec<T> {
        let mut items = self.items.lock().await;
        let drained: Vec<T> = items.drain(..).collect();
        self.ready.forget_permits(drained.len());
        drained
    }
}
