use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::info;

/// Notified with the queue state and reason seen on each pending poll.
pub trait QueueStateObserver: Send + Sync {
    fn on_queue_state(&self, request_id: &str, queue_state: Option<&str>, reason: Option<&str>);
}

/// Logs each notification at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl QueueStateObserver for LoggingObserver {
    fn on_queue_state(&self, request_id: &str, queue_state: Option<&str>, reason: Option<&str>) {
        info!(
            request_id,
            queue_state = queue_state.unwrap_or("-"),
            reason = reason.unwrap_or("-"),
            "request still queued"
        );
    }
}

#[derive(Debug)]
struct Seen {
    queue_state: Option<String>,
    reason: Option<String>,
    at: Instant,
}

/// Forwards to `inner` unless the same request reported the same
/// `(queue_state, reason)` pair within `window`.
///
/// Remembers at most `capacity` requests. Entries older than `window` are
/// evicted first, then the oldest.
#[derive(Debug)]
pub struct DebouncedObserver<O> {
    inner: O,
    window: Duration,
    capacity: usize,
    seen: Mutex<HashMap<String, Seen>>,
}

impl Default for DebouncedObserver<LoggingObserver> {
    fn default() -> Self {
        Self::new(LoggingObserver, Duration::from_secs(60), 1024)
    }
}

impl<O: QueueStateObserver> DebouncedObserver<O> {
    pub fn new(inner: O, window: Duration, capacity: usize) -> Self {
        Self {
            inner,
            window,
            capacity: capacity.max(1),
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &O {
        &self.inner
    }

    /// Requests currently remembered.
    pub fn tracked(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn should_forward(&self, request_id: &str, queue_state: Option<&str>, reason: Option<&str>) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(prev) = seen.get(request_id) {
            if prev.queue_state.as_deref() == queue_state
                && prev.reason.as_deref() == reason
                && now.duration_since(prev.at) < self.window
            {
                return false;
            }
        }
        if !seen.contains_key(request_id) && seen.len() >= self.capacity {
            seen.retain(|_, s| now.duration_since(s.at) < self.window);
            if seen.len() >= self.capacity {
                if let Some(oldest) = seen
                    .iter()
                    .min_by_key(|(_, s)| s.at)
                    .map(|(k, _)| k.clone())
                {
                    seen.remove(&oldest);
                }
            }
        }
        seen.insert(
            request_id.to_string(),
            Seen {
                queue_state: queue_state.map(str::to_string),
                reason: reason.map(str::to_string),
                at: now,
            },
        );
        true
    }
}

impl<O: QueueStateObserver> QueueStateObserver for DebouncedObserver<O> {
    fn on_queue_state(&self, request_id: &str, queue_state: Option<&str>, reason: Option<&str>) {
        if self.should_forward(request_id, queue_state, reason) {
            self.inner.on_queue_state(request_id, queue_state, reason);
        }
    }
}
