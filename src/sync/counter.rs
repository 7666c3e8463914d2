use std::sync::atomic::{AtomicI64, Ordering};

/// A shared integer whose every mutation is a single atomic step.
///
/// Concurrent `increment`/`decrement`/`add` calls never lose updates: the final
/// value is always the net sum of all deltas.
#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: AtomicI64,
}

impl AtomicCounter {
    pub fn new(initial: i64) -> Self {
        Self {
            value: AtomicI64::new(initial),
        }
    }

    /// Adds one and returns the new value.
    pub fn increment(&self) -> i64 {
        self.add(1)
    }

    /// Subtracts one and returns the new value.
    pub fn decrement(&self) -> i64 {
        self.add(-1)
    }

    /// Adds `delta` and returns the new value.
    pub fn add(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, Ordering::SeqCst).wrapping_add(delta)
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::SeqCst);
    }

    /// Swaps in `update` only if the current value equals `expected`.
    pub fn compare_and_set(&self, expected: i64, update: i64) -> bool {
        self.value
            .compare_exchange(expected, update, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Applies `f` through a compare-and-set retry loop and returns the value it stored.
    pub fn update<F>(&self, f: F) -> i64
    where
        F: Fn(i64) -> i64,
    {
        loop {
            let current = self.get();
            let next = f(current);
            if self.compare_and_set(current, next) {
                return next;
            }
        }
    }
}
