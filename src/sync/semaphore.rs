use super::bounded;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;

/// A counting semaphore that serves waiters in arrival order.
///
/// Permits are handed out as [`Permit`] values; dropping one (or calling
/// [`Permit::release`]) returns it and wakes the longest-waiting caller.
#[derive(Debug)]
pub struct Semaphore {
    inner: Arc<tokio::sync::Semaphore>,
    waiting: Arc<AtomicUsize>,
}

/// One permit checked out of a [`Semaphore`].
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

impl Permit {
    /// Returns the permit to its semaphore.
    pub fn release(self) {}
}

struct WaitRegistration<'a>(&'a AtomicUsize);

impl<'a> WaitRegistration<'a> {
    fn register(waiting: &'a AtomicUsize) -> Self {
        waiting.fetch_add(1, Ordering::SeqCst);
        Self(waiting)
    }
}

impl Drop for WaitRegistration<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Semaphore::new(permits)),
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Suspends until a permit is free or `timeout` elapses.
    ///
    /// Returns `None` on timeout or once the semaphore has been drained.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Option<Permit> {
        if let Some(permit) = self.try_acquire() {
            return Some(permit);
        }
        let _registration = WaitRegistration::register(&self.waiting);
        let acquired = bounded(self.inner.clone().acquire_owned(), timeout).await?;
        acquired.ok().map(|permit| Permit { _permit: permit })
    }

    /// Takes a permit only if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit> {
        self.inner
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Permit { _permit: permit })
    }

    /// Runs `f` while holding a permit; the permit is returned on every exit path.
    pub async fn with_permit<F, Fut, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let _permit = self.acquire(None).await?;
        Some(f().await)
    }

    pub fn available_permits(&self) -> usize {
        self.inner.available_permits()
    }

    /// Number of callers currently suspended in [`Semaphore::acquire`].
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Closes the semaphore for good and returns how many waiters were cut loose.
    ///
    /// Pending waiters wake with `None`. Every later `acquire`, `try_acquire`
    /// and `with_permit` fails as well, even after held permits are returned,
    /// so a drained semaphore cannot be reused. Permits already held stay
    /// valid until dropped.
    pub fn drain(&self) -> usize {
        let drained = self.waiting();
        self.inner.close();
        drained
    }

    pub fn is_drained(&self) -> bool {
        self.inner.is_closed()
    }
}
