//! Shared rate-limit backoff window per destination.
//!
//! When any caller sees a 429 from a destination it extends that
//! destination's window; every other caller consults the window before
//! dispatching and waits it out. This keeps independently retrying callers
//! from re-triggering the same limit.
//!
//! The deadline is an atomic offset from a process-local monotonic epoch.
//! Extensions merge with `fetch_max`, so concurrent writers can only push the
//! deadline later; only [`RateLimitEntry::clear`] moves it back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CoreError;

/// Registry of per-destination windows.
#[derive(Debug)]
pub struct RateLimitWindow {
    epoch: Instant,
    entries: RwLock<HashMap<String, Arc<RateLimitEntry>>>,
}

impl Default for RateLimitWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitWindow {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Entry for `destination`, created on first use.
    pub fn for_key(&self, destination: &str) -> Arc<RateLimitEntry> {
        if let Some(entry) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(destination)
        {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(entries.entry(destination.to_string()).or_insert_with(|| {
            Arc::new(RateLimitEntry {
                key: destination.to_string(),
                epoch: self.epoch,
                until: AtomicU64::new(0),
            })
        }))
    }
}

/// Backoff deadline for one destination.
#[derive(Debug)]
pub struct RateLimitEntry {
    key: String,
    epoch: Instant,
    /// Nanoseconds after `epoch` plus one; 0 means no active backoff.
    until: AtomicU64,
}

impl RateLimitEntry {
    pub fn key(&self) -> &str {
        &self.key
    }

    fn now_ticks(&self) -> u64 {
        let nanos = self.epoch.elapsed().as_nanos();
        u64::try_from(nanos).unwrap_or(u64::MAX - 1).saturating_add(1)
    }

    /// Whether callers should hold off right now.
    pub fn should_backoff(&self) -> bool {
        self.remaining() > Duration::ZERO
    }

    /// Time left in the window (zero when not backing off).
    pub fn remaining(&self) -> Duration {
        let until = self.until.load(Ordering::Acquire);
        if until == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(until.saturating_sub(self.now_ticks()))
    }

    /// Extend the window to at least `duration` from now. Never shortens an
    /// existing, later deadline.
    pub fn set(&self, duration: Duration) {
        let add = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        let deadline = self.now_ticks().saturating_add(add);
        let previous = self.until.fetch_max(deadline, Ordering::AcqRel);
        if deadline > previous {
            debug!(key = %self.key, ?duration, "rate-limit window extended");
        }
    }

    /// End the window immediately.
    pub fn clear(&self) {
        self.until.store(0, Ordering::Release);
    }

    /// Suspend until the window has elapsed. An extension made while
    /// sleeping is honoured.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), CoreError> {
        loop {
            let remaining = self.remaining();
            if remaining.is_zero() {
                return Ok(());
            }
            debug!(key = %self.key, ?remaining, "waiting out rate-limit window");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_entry_is_not_backing_off() {
        let w = RateLimitWindow::new();
        let e = w.for_key("https://api.example.com:443");
        assert!(!e.should_backoff());
        assert_eq!(e.remaining(), Duration::ZERO);
    }

    #[test]
    fn same_key_shares_entry() {
        let w = RateLimitWindow::new();
        let a = w.for_key("d");
        let b = w.for_key("d");
        assert!(Arc::ptr_eq(&a, &b));
        a.set(Duration::from_secs(5));
        assert!(b.should_backoff());
        assert!(!w.for_key("other").should_backoff());
    }

    #[test]
    fn shorter_set_does_not_shrink_window() {
        let w = RateLimitWindow::new();
        let e = w.for_key("d");
        e.set(Duration::from_secs(10));
        e.set(Duration::from_millis(1));
        assert!(e.remaining() > Duration::from_secs(9));
    }

    #[test]
    fn clear_ends_window() {
        let w = RateLimitWindow::new();
        let e = w.for_key("d");
        e.set(Duration::from_secs(10));
        e.clear();
        assert!(!e.should_backoff());
    }

    #[tokio::test]
    async fn wait_returns_after_window() {
        let w = RateLimitWindow::new();
        let e = w.for_key("d");
        e.set(Duration::from_millis(40));
        let started = Instant::now();
        e.wait(&CancellationToken::new()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(35));
        assert!(!e.should_backoff());
    }

    #[tokio::test]
    async fn wait_honours_extension_made_while_sleeping() {
        let w = RateLimitWindow::new();
        let e = w.for_key("d");
        e.set(Duration::from_millis(20));
        let extender = Arc::clone(&e);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            extender.set(Duration::from_millis(60));
        });
        let started = Instant::now();
        e.wait(&CancellationToken::new()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn wait_is_cancellable() {
        let w = RateLimitWindow::new();
        let e = w.for_key("d");
        e.set(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(e.wait(&cancel).await, Err(CoreError::Cancelled));
    }

    #[test]
    fn concurrent_extensions_keep_latest_deadline() {
        let w = Arc::new(RateLimitWindow::new());
        let handles: Vec<_> = (1..=16u64)
            .map(|i| {
                let w = Arc::clone(&w);
                std::thread::spawn(move || w.for_key("d").set(Duration::from_secs(i)))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(w.for_key("d").remaining() > Duration::from_secs(15));
    }
}
