//! Thread-safe building blocks shared by the messaging layer and its callers.
//!
//! Every suspending operation accepts an optional timeout. A timed-out call
//! returns `None`/`false` and leaves shared state as if it had never been made:
//! the waiter registration lives inside the awaited future, so dropping that
//! future on timeout removes it.

pub mod cache;
pub mod counter;
pub mod map;
pub mod mutex;
pub mod pool;
pub mod queue;
pub mod semaphore;

pub use cache::ConcurrentCache;
pub use counter::AtomicCounter;
pub use map::ConcurrentMap;
pub use mutex::Mutex;
pub use pool::{PooledResource, ResourcePool};
pub use queue::ConcurrentQueue;
pub use semaphore::{Permit, Semaphore};

use std::future::Future;
use std::time::Duration;

/// Awaits `fut`, bounded by `timeout` when one is given.
pub(crate) async fn bounded<F: Future>(fut: F, timeout: Option<Duration>) -> Option<F::Output> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}
