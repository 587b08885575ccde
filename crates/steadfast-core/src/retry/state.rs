//! Per-call retry bookkeeping.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Shared "last progress" timestamp.
///
/// The operation holds a clone and calls [`mark`](Self::mark) when it sees
/// forward movement (for a poll: a changed queue state or reason). The retry
/// loop reads it to enforce the progress timeout.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    last: Arc<Mutex<Instant>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn mark(&self) {
        let now = Instant::now();
        match self.last.lock() {
            Ok(mut last) => *last = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    pub fn last(&self) -> Instant {
        match self.last.lock() {
            Ok(last) => *last,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn since_last(&self) -> Duration {
        self.last().elapsed()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// State of one call in flight. Discarded when the call completes.
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Retries performed so far (0 on the first attempt).
    pub attempt: u32,
    pub started_at: Instant,
    pub progress: ProgressTracker,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            started_at: Instant::now(),
            progress: ProgressTracker::new(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn last_progress_at(&self) -> Instant {
        self.progress.last()
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

/// What an operation learns about the attempt it is running.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub attempt: u32,
    pub progress: ProgressTracker,
}
