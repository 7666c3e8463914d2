use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// A cached value with its insertion time and time-to-live.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    pub fn expires_at(&self) -> Instant {
        self.inserted_at + self.ttl
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }
}

/// Key/value store whose entries expire after a per-entry TTL.
///
/// Expiry is checked on every read, so `get` never returns an expired value
/// whether or not [`ConcurrentCache::cleanup`] has run.
#[derive(Debug)]
pub struct ConcurrentCache<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> Default for ConcurrentCache<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> ConcurrentCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, key: K, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
            ttl,
        };
        self.entries.write().await.insert(key, entry);
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: evict unless it was refreshed in the meantime.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
        }
        None
    }

    pub async fn has(&self, key: &K) -> bool {
        self.get(key).await.is_some()
    }

    pub async fn delete(&self, key: &K) -> Option<V> {
        self.entries.write().await.remove(key).map(|entry| entry.value)
    }

    /// Removes every expired entry and returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_get_hides_expired_entry_without_cleanup() {
        let cache = ConcurrentCache::new();
        cache.set("k", 1, Duration::from_secs(10)).await;
        assert_eq!(cache.get(&"k").await, Some(1));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get(&"k").await, None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_counts_removed_entries() {
        let cache = ConcurrentCache::new();
        cache.set(1, "short", Duration::from_secs(1)).await;
        cache.set(2, "short", Duration::from_secs(2)).await;
        cache.set(3, "long", Duration::from_secs(60)).await;

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.cleanup().await, 2);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get(&3).await, Some("long"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_refreshes_ttl() {
        let cache = ConcurrentCache::new();
        cache.set("k", 1, Duration::from_secs(2)).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.set("k", 2, Duration::from_secs(2)).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get(&"k").await, Some(2));
    }
}
