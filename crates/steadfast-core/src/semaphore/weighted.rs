//! Keyed byte-budget semaphore.
//!
//! Admission rule: a request of weight `w` is admitted when
//! `committed + w <= budget`, or when nothing is committed at all. The second
//! clause lets a single payload larger than the whole budget through on an
//! idle key instead of blocking it forever; while it is in flight every other
//! acquisition on that key waits.
//!
//! Waiters are admitted strictly in arrival order. A new request never jumps
//! ahead of one already queued, even when it would fit, so a large payload
//! cannot be starved by a stream of small ones.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::CoreError;

use super::deadline_elapsed;

#[derive(Debug, Default)]
struct BudgetState {
    committed: u64,
    /// Tickets of waiting acquisitions, oldest first.
    queue: VecDeque<u64>,
    next_ticket: u64,
}

#[derive(Debug)]
struct ByteBudget {
    limit: u64,
    state: Mutex<BudgetState>,
    released: Notify,
}

impl ByteBudget {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            state: Mutex::new(BudgetState::default()),
            released: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fits(&self, state: &BudgetState, weight: u64) -> bool {
        state.committed == 0
            || state
                .committed
                .checked_add(weight)
                .is_some_and(|total| total <= self.limit)
    }

    /// Commit for a caller that is not queued; refused while anyone waits.
    fn try_commit(&self, weight: u64) -> bool {
        let mut state = self.lock();
        if state.queue.is_empty() && self.fits(&state, weight) {
            state.committed = state.committed.saturating_add(weight);
            return true;
        }
        false
    }

    fn enqueue(&self) -> u64 {
        let mut state = self.lock();
        let ticket = state.next_ticket;
        state.next_ticket = state.next_ticket.wrapping_add(1);
        state.queue.push_back(ticket);
        ticket
    }

    /// Commit for a queued caller; only the head of the queue may proceed.
    fn try_commit_queued(&self, ticket: u64, weight: u64) -> bool {
        {
            let mut state = self.lock();
            if state.queue.front() != Some(&ticket) || !self.fits(&state, weight) {
                return false;
            }
            state.queue.pop_front();
            state.committed = state.committed.saturating_add(weight);
        }
        // The next head may fit in what is left.
        self.released.notify_waiters();
        true
    }

    fn leave(&self, ticket: u64) {
        let was_head = {
            let mut state = self.lock();
            let was_head = state.queue.front() == Some(&ticket);
            state.queue.retain(|t| *t != ticket);
            was_head
        };
        if was_head {
            self.released.notify_waiters();
        }
    }

    fn release(&self, weight: u64) {
        {
            let mut state = self.lock();
            state.committed = state.committed.saturating_sub(weight);
        }
        self.released.notify_waiters();
    }

    fn committed(&self) -> u64 {
        self.lock().committed
    }

    fn waiting(&self) -> usize {
        self.lock().queue.len()
    }
}

/// A place in a budget's queue; gives it up on drop unless admitted.
struct QueuedTicket<'a> {
    budget: &'a ByteBudget,
    ticket: u64,
    admitted: bool,
}

impl Drop for QueuedTicket<'_> {
    fn drop(&mut self) {
        if !self.admitted {
            self.budget.leave(self.ticket);
        }
    }
}

/// Per-key byte budgets sharing one limit.
#[derive(Debug)]
pub struct WeightedSemaphore {
    limit: u64,
    budgets: RwLock<HashMap<String, Arc<ByteBudget>>>,
}

impl WeightedSemaphore {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            budgets: RwLock::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn budget(&self, key: &str) -> Arc<ByteBudget> {
        if let Some(b) = self
            .budgets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Arc::clone(b);
        }
        let mut budgets = self.budgets.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            budgets
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(ByteBudget::new(self.limit))),
        )
    }

    /// Bytes currently committed for `key`.
    pub fn committed(&self, key: &str) -> u64 {
        self.budgets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|b| b.committed())
            .unwrap_or(0)
    }

    /// Acquisitions queued on `key`.
    pub fn waiting(&self, key: &str) -> usize {
        self.budgets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|b| b.waiting())
            .unwrap_or(0)
    }

    /// Commit `weight` bytes if the budget allows it right now and no earlier
    /// acquisition is waiting.
    pub fn try_acquire(&self, key: &str, weight: u64) -> Option<WeightedPermit> {
        let budget = self.budget(key);
        if budget.try_commit(weight) {
            Some(WeightedPermit {
                budget,
                weight,
                released: false,
            })
        } else {
            None
        }
    }

    /// Commit `weight` bytes, waiting for releases while the budget is full.
    pub async fn acquire(
        &self,
        key: &str,
        weight: u64,
        deadline: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<WeightedPermit, CoreError> {
        let budget = self.budget(key);
        if weight > budget.limit {
            debug!(key, weight, limit = budget.limit, "payload exceeds byte budget");
        }
        if budget.try_commit(weight) {
            return Ok(WeightedPermit {
                budget,
                weight,
                released: false,
            });
        }

        let started = Instant::now();
        let deadline_at = deadline.map(|d| started + d);
        let mut queued = QueuedTicket {
            budget: &budget,
            ticket: budget.enqueue(),
            admitted: false,
        };
        loop {
            // Register for wakeups before checking so a release between the
            // check and the await is not missed.
            let notified = budget.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if budget.try_commit_queued(queued.ticket, weight) {
                queued.admitted = true;
                return Ok(WeightedPermit {
                    budget: Arc::clone(&budget),
                    weight,
                    released: false,
                });
            }
            trace!(
                key,
                weight,
                committed = budget.committed(),
                waiting = budget.waiting(),
                "byte budget full"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                _ = deadline_elapsed(deadline_at) => {
                    return Err(CoreError::Overloaded {
                        resource: format!("byte budget for {key}"),
                        waited: started.elapsed(),
                    });
                }
                _ = &mut notified => {}
            }
        }
    }

    /// Return `weight` bytes to `key`. Pairs with [`WeightedPermit::forget`].
    pub fn release(&self, key: &str, weight: u64) {
        self.budget(key).release(weight);
    }
}

/// Returns its bytes to the budget when dropped.
#[derive(Debug)]
pub struct WeightedPermit {
    budget: Arc<ByteBudget>,
    weight: u64,
    released: bool,
}

impl WeightedPermit {
    pub fn weight(&self) -> u64 {
        self.weight
    }

    /// Keep the bytes committed after drop; release them later with
    /// [`WeightedSemaphore::release`].
    pub fn forget(mut self) {
        self.released = true;
    }
}

impl Drop for WeightedPermit {
    fn drop(&mut self) {
        if !self.released {
            self.budget.release(self.weight);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1_000_000;

    #[test]
    fn exact_fit_is_admitted_and_one_more_byte_is_not() {
        let sem = WeightedSemaphore::new(5 * MB);
        let _a = sem.try_acquire("d", 4 * MB).unwrap();
        let _b = sem.try_acquire("d", MB).unwrap();
        assert_eq!(sem.committed("d"), 5 * MB);
        assert!(sem.try_acquire("d", 1).is_none());
    }

    #[test]
    fn oversized_payload_admitted_when_idle() {
        let sem = WeightedSemaphore::new(5 * MB);
        let big = sem.try_acquire("d", 6 * MB).unwrap();
        assert_eq!(sem.committed("d"), 6 * MB);
        assert!(sem.try_acquire("d", 1).is_none());
        drop(big);
        assert_eq!(sem.committed("d"), 0);
    }

    #[test]
    fn oversized_payload_waits_when_busy() {
        let sem = WeightedSemaphore::new(5 * MB);
        let _small = sem.try_acquire("d", 1).unwrap();
        assert!(sem.try_acquire("d", 6 * MB).is_none());
    }

    #[test]
    fn keys_have_separate_budgets() {
        let sem = WeightedSemaphore::new(5 * MB);
        let _a = sem.try_acquire("a", 5 * MB).unwrap();
        assert!(sem.try_acquire("b", 5 * MB).is_some());
    }

    #[test]
    fn forget_then_release_pairs() {
        let sem = WeightedSemaphore::new(10);
        sem.try_acquire("d", 7).unwrap().forget();
        assert_eq!(sem.committed("d"), 7);
        sem.release("d", 7);
        assert_eq!(sem.committed("d"), 0);
    }

    #[tokio::test]
    async fn blocked_acquire_proceeds_after_release() {
        let sem = Arc::new(WeightedSemaphore::new(5 * MB));
        let held = sem.try_acquire("d", 4 * MB).unwrap();

        let waiter = {
            let sem = Arc::clone(&sem);
            tokio::spawn(async move {
                sem.acquire("d", 2 * MB, None, &CancellationToken::new())
                    .await
                    .map(|p| p.weight())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "6MB over a 5MB budget must wait");

        drop(held);
        let weight = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should wake on release")
            .unwrap()
            .unwrap();
        assert_eq!(weight, 2 * MB);
        assert_eq!(sem.committed("d"), 0);
    }

    #[tokio::test]
    async fn deadline_yields_overloaded() {
        let sem = WeightedSemaphore::new(10);
        let _held = sem.try_acquire("d", 10).unwrap();
        let err = sem
            .acquire("d", 1, Some(Duration::from_millis(20)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Overloaded { .. }));
        assert_eq!(sem.committed("d"), 10);
    }

    #[tokio::test]
    async fn cancelled_wait_commits_nothing() {
        let sem = WeightedSemaphore::new(10);
        let _held = sem.try_acquire("d", 10).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = sem.acquire("d", 5, None, &cancel).await.unwrap_err();
        assert_eq!(err, CoreError::Cancelled);
        assert_eq!(sem.committed("d"), 10);
    }

    #[tokio::test]
    async fn small_requests_do_not_overtake_a_waiting_large_one() {
        let sem = Arc::new(WeightedSemaphore::new(5));
        let held = sem.try_acquire("d", 3).unwrap();

        let large = {
            let sem = Arc::clone(&sem);
            tokio::spawn(async move {
                sem.acquire("d", 3, None, &CancellationToken::new())
                    .await
                    .map(|p| p.weight())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sem.waiting("d"), 1);

        // 3 + 1 fits, but the large request arrived first.
        assert!(sem.try_acquire("d", 1).is_none());
        let small = {
            let sem = Arc::clone(&sem);
            tokio::spawn(async move {
                sem.acquire("d", 1, None, &CancellationToken::new())
                    .await
                    .map(|p| p.forget())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!small.is_finished());
        assert!(!large.is_finished());

        drop(held);
        let weight = tokio::time::timeout(Duration::from_secs(2), large)
            .await
            .expect("large request should be admitted once the holder leaves")
            .unwrap()
            .unwrap();
        assert_eq!(weight, 3);
        tokio::time::timeout(Duration::from_secs(2), small)
            .await
            .expect("small request follows the large one")
            .unwrap()
            .unwrap();
        assert_eq!(sem.committed("d"), 1);
        assert_eq!(sem.waiting("d"), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_the_queue() {
        let sem = Arc::new(WeightedSemaphore::new(5));
        let _held = sem.try_acquire("d", 3).unwrap();
        let cancel = CancellationToken::new();

        let large = {
            let sem = Arc::clone(&sem);
            let cancel = cancel.clone();
            tokio::spawn(async move { sem.acquire("d", 3, None, &cancel).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sem.try_acquire("d", 1).is_none());

        cancel.cancel();
        let err = large.await.unwrap().unwrap_err();
        assert_eq!(err, CoreError::Cancelled);
        assert_eq!(sem.waiting("d"), 0);
        assert!(sem.try_acquire("d", 1).is_some());
    }

    #[tokio::test]
    async fn timed_out_waiter_unblocks_the_next_one() {
        let sem = Arc::new(WeightedSemaphore::new(5));
        let _held = sem.try_acquire("d", 3).unwrap();

        let large = {
            let sem = Arc::clone(&sem);
            tokio::spawn(async move {
                sem.acquire("d", 3, Some(Duration::from_millis(100)), &CancellationToken::new())
                    .await
                    .map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let small = sem
            .acquire("d", 2, Some(Duration::from_secs(2)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(small.weight(), 2);
        assert!(matches!(
            large.await.unwrap().unwrap_err(),
            CoreError::Overloaded { .. }
        ));
    }
}
