use super::bounded;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Creates a new resource when the pool has spare capacity.
pub type ResourceFactory<T> = Box<dyn Fn() -> T + Send + Sync>;
/// Disposes of a resource removed from the pool.
pub type DestroyCallback<T> = Box<dyn Fn(T) + Send + Sync>;

/// Point-in-time pool occupancy. `available + in_use == total <= max_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub available: usize,
    pub in_use: usize,
    pub total: usize,
    pub max_size: usize,
}

struct PoolState<T> {
    available: Vec<(u64, T)>,
    in_use: usize,
    total: usize,
    next_id: u64,
    destroyed: bool,
}

struct PoolInner<T> {
    factory: ResourceFactory<T>,
    destroy: Option<DestroyCallback<T>>,
    max_size: usize,
    state: std::sync::Mutex<PoolState<T>>,
    // One permit per resource that may be checked out.
    checkouts: Arc<Semaphore>,
}

impl<T> PoolInner<T> {
    fn state(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checkout(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Option<PooledResource<T>> {
        let reused = {
            let mut state = self.state();
            if state.destroyed {
                return None;
            }
            let reused = state.available.pop();
            if reused.is_some() {
                state.in_use += 1;
            }
            reused
        };
        let (id, value) = match reused {
            Some(resource) => resource,
            None => self.create()?,
        };
        Some(PooledResource {
            id,
            value: Some(value),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    // Counts are only committed once the factory has returned, so a
    // panicking factory leaves the pool as it was. The caller's permit
    // keeps `total` within `max_size`.
    fn create(&self) -> Option<(u64, T)> {
        let value = (self.factory)();
        {
            let mut state = self.state();
            if !state.destroyed {
                state.in_use += 1;
                state.total += 1;
                state.next_id += 1;
                return Some((state.next_id, value));
            }
        }
        if let Some(destroy) = &self.destroy {
            destroy(value);
        }
        None
    }

    fn give_back(&self, id: u64, value: T) {
        let retired = {
            let mut state = self.state();
            state.in_use -= 1;
            if state.destroyed {
                state.total -= 1;
                Some(value)
            } else {
                state.available.push((id, value));
                None
            }
        };
        if let (Some(value), Some(destroy)) = (retired, &self.destroy) {
            destroy(value);
        }
    }
}

/// A bounded set of reusable resources.
///
/// A checked-out resource is exclusively owned by its [`PooledResource`]
/// handle and goes back to the pool when the handle is dropped or passed to
/// [`ResourcePool::release`]. Blocked acquirers are not served in any
/// particular order.
pub struct ResourcePool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for ResourcePool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> ResourcePool<T> {
    pub fn new(factory: ResourceFactory<T>, max_size: usize) -> Self {
        Self::build(factory, max_size, None)
    }

    pub fn with_destroy(
        factory: ResourceFactory<T>,
        max_size: usize,
        destroy: DestroyCallback<T>,
    ) -> Self {
        Self::build(factory, max_size, Some(destroy))
    }

    fn build(
        factory: ResourceFactory<T>,
        max_size: usize,
        destroy: Option<DestroyCallback<T>>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                destroy,
                max_size,
                state: std::sync::Mutex::new(PoolState {
                    available: Vec::new(),
                    in_use: 0,
                    total: 0,
                    next_id: 0,
                    destroyed: false,
                }),
                checkouts: Arc::new(Semaphore::new(max_size)),
            }),
        }
    }

    /// Returns a free resource, creating one if under capacity.
    ///
    /// Returns `None` immediately when every resource is checked out.
    pub fn acquire(&self) -> Option<PooledResource<T>> {
        let permit = self.inner.checkouts.clone().try_acquire_owned().ok()?;
        self.inner.checkout(permit)
    }

    /// Suspends until a resource is released or `timeout` elapses.
    pub async fn acquire_blocking(&self, timeout: Option<Duration>) -> Option<PooledResource<T>> {
        let permit = bounded(self.inner.checkouts.clone().acquire_owned(), timeout)
            .await?
            .ok()?;
        self.inner.checkout(permit)
    }

    /// Hands `resource` back and wakes one blocked acquirer.
    pub fn release(&self, resource: PooledResource<T>) {
        drop(resource);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state();
        PoolStats {
            available: state.available.len(),
            in_use: state.in_use,
            total: state.total,
            max_size: self.inner.max_size,
        }
    }

    /// Destroys every idle resource and shuts the pool.
    ///
    /// Resources still checked out are destroyed when they are released.
    /// Returns the number destroyed immediately.
    pub fn destroy_pool(&self) -> usize {
        let idle = {
            let mut state = self.inner.state();
            state.destroyed = true;
            let idle = std::mem::take(&mut state.available);
            state.total -= idle.len();
            idle
        };
        self.inner.checkouts.close();
        let count = idle.len();
        if let Some(destroy) = &self.inner.destroy {
            for (_, value) in idle {
                destroy(value);
            }
        }
        count
    }
}

/// Exclusive handle on a pooled resource.
pub struct PooledResource<T> {
    id: u64,
    value: Option<T>,
    pool: Arc<PoolInner<T>>,
    _permit: OwnedSemaphorePermit,
}

impl<T> PooledResource<T> {
    /// Stable identity of the underlying resource within its pool.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Deref for PooledResource<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled value is present until drop"))
    }
}

impl<T> DerefMut for PooledResource<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value
            .as_mut()
            .unwrap_or_else(|| unreachable!("pooled value is present until drop"))
    }
}

impl<T> Drop for PooledResource<T> {
    fn drop(&mut self) {
        // The permit field drops after this, so the resource is back before a waiter wakes.
        if let Some(value) = self.value.take() {
            self.pool.give_back(self.id, value);
        }
    }
}
