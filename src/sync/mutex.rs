use super::bounded;
use std::time::Duration;

pub use tokio::sync::MutexGuard;

/// Suspension-based mutual exclusion around a value of type `T`.
///
/// Ownership is represented by the returned guard: the lock is released when
/// the guard is dropped, which also happens while unwinding from a panic.
///
/// Waiter order is NOT part of the contract. Callers must not rely on being
/// served in arrival order; use [`super::Semaphore`] when FIFO matters.
#[derive(Debug, Default)]
pub struct Mutex<T> {
    inner: tokio::sync::Mutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(value),
        }
    }

    /// Suspends until the lock is held.
    pub async fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().await
    }

    /// Suspends until the lock is held or `timeout` elapses.
    ///
    /// Returns `None` on timeout; the caller never holds a partial lock.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Option<MutexGuard<'_, T>> {
        bounded(self.inner.lock(), timeout).await
    }

    /// Takes the lock only if it is free right now.
    pub fn try_acquire(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock().ok()
    }

    /// Runs `f` with the lock held and releases it on every exit path.
    pub async fn with_lock<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut guard = self.inner.lock().await;
        f(&mut guard)
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}
