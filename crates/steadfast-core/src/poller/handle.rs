use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::OnceCell;

use crate::error::CoreError;
use crate::pool::PoolKey;
use crate::transport::HttpRequest;

/// Client-side view of the job's queue position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueState {
    /// Server says the job is queued or running.
    #[default]
    Pending,
    /// Last poll failed (5xx, network, 429); polling continues.
    Retry,
    /// Result received.
    Ready,
    /// Server discarded the job.
    Expired,
}

/// Snapshot of what the last polls reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromiseStatus {
    pub state: QueueState,
    /// Server-supplied `queue_state`, if any.
    pub queue_state: Option<String>,
    /// Server-supplied `queue_state_reason`, if any.
    pub reason: Option<String>,
    pub last_poll: Option<Instant>,
    /// Last transient failure seen while polling.
    pub last_error: Option<String>,
}

/// Handle for one asynchronous job.
#[derive(Debug)]
pub struct PromiseHandle {
    request_id: String,
    key: PoolKey,
    request: HttpRequest,
    status: Mutex<PromiseStatus>,
    polls: AtomicU64,
    pub(super) result: OnceCell<Result<Value, CoreError>>,
}

impl PromiseHandle {
    /// `request` is sent on every poll; `key` is the pool it goes through.
    pub fn new(request_id: impl Into<String>, key: PoolKey, request: HttpRequest) -> Self {
        Self {
            request_id: request_id.into(),
            key,
            request,
            status: Mutex::new(PromiseStatus::default()),
            polls: AtomicU64::new(0),
            result: OnceCell::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn pool_key(&self) -> &PoolKey {
        &self.key
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn status(&self) -> PromiseStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Network polls made so far.
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Acquire)
    }

    /// Terminal result, once there is one.
    pub fn cached(&self) -> Option<Result<Value, CoreError>> {
        self.result.get().cloned()
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.result.get(), Some(Ok(_)))
    }

    pub(super) fn record_poll(&self) {
        self.polls.fetch_add(1, Ordering::AcqRel);
        self.update(|s| s.last_poll = Some(Instant::now()));
    }

    pub(super) fn update<R>(&self, f: impl FnOnce(&mut PromiseStatus) -> R) -> R {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut status)
    }
}
