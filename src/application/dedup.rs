use crate::domain::message::IdempotencyKey;
use crate::sync::ConcurrentCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Remembers idempotency keys of messages that were processed successfully.
///
/// Keys are forgotten after `ttl`; a redelivery arriving later than that is
/// processed again.
#[derive(Debug)]
pub struct Deduplicator {
    seen: ConcurrentCache<IdempotencyKey, ()>,
    ttl: Duration,
}

impl Deduplicator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: ConcurrentCache::new(),
            ttl,
        }
    }

    pub async fn is_processed(&self, key: &IdempotencyKey) -> bool {
        self.seen.has(key).await
    }

    pub async fn mark_processed(&self, key: IdempotencyKey) {
        self.seen.set(key, (), self.ttl).await;
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Keys held, including expired ones not yet swept.
    pub async fn len(&self) -> usize {
        self.seen.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.seen.is_empty().await
    }

    /// Drops expired keys. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        self.seen.cleanup().await
    }

    /// Sweeps expired keys every `interval` until `shutdown` turns `true` or its sender goes away.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let removed = self.sweep().await;
                        if removed > 0 {
                            tracing::debug!(removed, "expired idempotency keys swept");
                        }
                    }
                }
            }
            tracing::debug!("idempotency key sweeper stopped");
        })
    }
}
