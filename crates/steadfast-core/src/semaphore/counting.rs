//! Keyed counting semaphore with backoff on contention.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::backoff::BackoffPolicy;
use crate::error::CoreError;

use super::deadline_elapsed;

/// Held-slot counters keyed by pool. Capacity is supplied per acquisition so
/// one semaphore can serve keys with different limits.
#[derive(Debug, Default)]
pub struct CountingSemaphore {
    counters: RwLock<HashMap<String, Arc<AtomicUsize>>>,
}

impl CountingSemaphore {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, key: &str) -> Arc<AtomicUsize> {
        if let Some(c) = self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Arc::clone(c);
        }
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(counters.entry(key.to_string()).or_default())
    }

    /// Slots currently held for `key`.
    pub fn held(&self, key: &str) -> usize {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Take a slot if one is free. A `capacity` of 0 is treated as 1 so a
    /// key can always make progress; config loading rejects 0 up front.
    pub fn try_acquire(&self, key: &str, capacity: usize) -> Option<CountingPermit> {
        let counter = self.counter(key);
        let capacity = capacity.max(1);
        let mut current = counter.load(Ordering::Acquire);
        loop {
            if current >= capacity {
                return None;
            }
            match counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(CountingPermit {
                        counter,
                        released: false,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Take a slot, sleeping `backoff` delays between tries while the key is
    /// at capacity.
    ///
    /// Returns `Overloaded` if `deadline` passes first and `Cancelled` if
    /// `cancel` fires; in both cases nothing is held.
    pub async fn acquire_blocking(
        &self,
        key: &str,
        capacity: usize,
        backoff: &BackoffPolicy,
        deadline: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<CountingPermit, CoreError> {
        let started = Instant::now();
        let deadline_at = deadline.map(|d| started + d);
        let mut attempt = 0u32;
        loop {
            if let Some(permit) = self.try_acquire(key, capacity) {
                return Ok(permit);
            }
            if deadline_at.is_some_and(|at| Instant::now() >= at) {
                return Err(CoreError::Overloaded {
                    resource: format!("connection slot for {key}"),
                    waited: started.elapsed(),
                });
            }
            let delay = backoff.delay(attempt);
            trace!(key, attempt, ?delay, capacity, "connection slots exhausted");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                _ = deadline_elapsed(deadline_at) => {}
                _ = tokio::time::sleep(delay) => {}
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// Release one slot for `key`. Pairs with [`CountingPermit::forget`].
    pub fn release(&self, key: &str) {
        release_one(&self.counter(key));
    }
}

fn release_one(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
}

/// Releases its slot when dropped.
#[derive(Debug)]
pub struct CountingPermit {
    counter: Arc<AtomicUsize>,
    released: bool,
}

impl CountingPermit {
    /// Keep the slot held after this permit is dropped; the caller must
    /// later call [`CountingSemaphore::release`].
    pub fn forget(mut self) {
        self.released = true;
    }
}

impl Drop for CountingPermit {
    fn drop(&mut self) {
        if !self.released {
            release_one(&self.counter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy::exponential(Duration::from_millis(1), Duration::from_millis(10))
    }

    #[test]
    fn try_acquire_respects_capacity() {
        let sem = CountingSemaphore::new();
        let a = sem.try_acquire("k", 2).unwrap();
        let _b = sem.try_acquire("k", 2).unwrap();
        assert!(sem.try_acquire("k", 2).is_none());
        assert_eq!(sem.held("k"), 2);
        drop(a);
        assert_eq!(sem.held("k"), 1);
        assert!(sem.try_acquire("k", 2).is_some());
    }

    #[test]
    fn zero_capacity_admits_one() {
        let sem = CountingSemaphore::new();
        let _a = sem.try_acquire("k", 0).unwrap();
        assert!(sem.try_acquire("k", 0).is_none());
    }

    #[test]
    fn keys_are_independent() {
        let sem = CountingSemaphore::new();
        let _a = sem.try_acquire("training", 1).unwrap();
        assert!(sem.try_acquire("training", 1).is_none());
        assert!(sem.try_acquire("session", 1).is_some());
    }

    #[test]
    fn release_never_underflows() {
        let sem = CountingSemaphore::new();
        sem.release("k");
        assert_eq!(sem.held("k"), 0);
    }

    #[test]
    fn forget_then_release_pairs() {
        let sem = CountingSemaphore::new();
        sem.try_acquire("k", 1).unwrap().forget();
        assert_eq!(sem.held("k"), 1);
        sem.release("k");
        assert_eq!(sem.held("k"), 0);
    }

    #[tokio::test]
    async fn third_acquire_blocks_until_release() {
        let sem = Arc::new(CountingSemaphore::new());
        let cancel = CancellationToken::new();
        let first = sem
            .acquire_blocking("k", 2, &fast_backoff(), None, &cancel)
            .await
            .unwrap();
        let _second = sem
            .acquire_blocking("k", 2, &fast_backoff(), None, &cancel)
            .await
            .unwrap();

        let waiter = {
            let sem = Arc::clone(&sem);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                sem.acquire_blocking("k", 2, &fast_backoff(), None, &cancel)
                    .await
                    .map(|_permit| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "third acquire must block");
        assert_eq!(sem.held("k"), 2);

        drop(first);
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should finish after release")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn deadline_yields_overloaded_and_holds_nothing() {
        let sem = CountingSemaphore::new();
        let _held = sem.try_acquire("k", 1).unwrap();
        let err = sem
            .acquire_blocking(
                "k",
                1,
                &fast_backoff(),
                Some(Duration::from_millis(30)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Overloaded { .. }));
        assert_eq!(sem.held("k"), 1);
    }

    #[tokio::test]
    async fn cancellation_unwinds() {
        let sem = CountingSemaphore::new();
        let _held = sem.try_acquire("k", 1).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = sem
            .acquire_blocking("k", 1, &fast_backoff(), None, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::Cancelled);
    }
}
