use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

type Slot<V> = Arc<Mutex<Option<V>>>;

/// An associative store with one lock per key.
///
/// `get`, `set`, `delete` and `has` only hold the slot lock of the key they
/// touch, so operations on different keys never wait on each other. The
/// index lock is held just long enough to find or create a slot. `keys`,
/// `size` and `snapshot` read a point-in-time view under the index lock.
#[derive(Debug)]
pub struct ConcurrentMap<K, V> {
    slots: RwLock<HashMap<K, Slot<V>>>,
}

impl<K, V> Default for ConcurrentMap<K, V> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    async fn existing_slot(&self, key: &K) -> Option<Slot<V>> {
        self.slots.read().await.get(key).cloned()
    }

    async fn slot(&self, key: &K) -> Slot<V> {
        if let Some(slot) = self.existing_slot(key).await {
            return slot;
        }
        self.slots
            .write()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let slot = self.existing_slot(key).await?;
        slot.lock().await.clone()
    }

    /// Stores `value` under `key` and returns the previous value.
    pub async fn set(&self, key: K, value: V) -> Option<V> {
        let slot = self.slot(&key).await;
        slot.lock().await.replace(value)
    }

    /// Stores `value` only when `key` is vacant. Returns whether it was stored.
    pub async fn set_if_absent(&self, key: K, value: V) -> bool {
        let slot = self.slot(&key).await;
        let mut current = slot.lock().await;
        if current.is_some() {
            return false;
        }
        *current = Some(value);
        true
    }

    pub async fn delete(&self, key: &K) -> Option<V> {
        let slot = self.existing_slot(key).await?;
        let removed = slot.lock().await.take();
        self.prune(key, &slot).await;
        removed
    }

    pub async fn has(&self, key: &K) -> bool {
        match self.existing_slot(key).await {
            Some(slot) => slot.lock().await.is_some(),
            None => false,
        }
    }

    /// Drops an emptied slot from the index once nobody else references it.
    async fn prune(&self, key: &K, slot: &Slot<V>) {
        let mut slots = self.slots.write().await;
        // References: the index and `slot`. Anything more is an in-flight operation.
        if Arc::strong_count(slot) != 2 {
            return;
        }
        let same_slot = slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot));
        let vacant = slot.try_lock().is_ok_and(|value| value.is_none());
        if same_slot && vacant {
            slots.remove(key);
        }
    }

    pub async fn keys(&self) -> Vec<K> {
        self.snapshot().await.into_iter().map(|(k, _)| k).collect()
    }

    pub async fn size(&self) -> usize {
        self.snapshot().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.size().await == 0
    }

    /// Copies every present entry.
    pub async fn snapshot(&self) -> Vec<(K, V)> {
        let slots = self.slots.read().await;
        let mut entries = Vec::with_capacity(slots.len());
        for (key, slot) in slots.iter() {
            if let Some(value) = slot.lock().await.clone() {
                entries.push((key.clone(), value));
            }
        }
        entries
    }

    pub async fn clear(&self) {
        self.slots.write().await.clear();
    }
}
