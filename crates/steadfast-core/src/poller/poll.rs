use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::BackoffPolicy;
use crate::error::CoreError;
use crate::rate_limit::RateLimitEntry;
use crate::retry::{AttemptContext, RetryHandler, RetrySettings, StopReason, Verdict};
use crate::telemetry::{Severity, TelemetryEvent, TelemetrySink};
use crate::transport::{HttpResponse, Transport};

use super::handle::{PromiseHandle, QueueState};
use super::observer::QueueStateObserver;

/// Knobs for [`FuturePoller`].
#[derive(Debug, Clone)]
pub struct PollerSettings {
    /// Delay between polls.
    pub backoff: BackoffPolicy,
    /// Abort when queue state and reason stay unchanged this long.
    pub progress_timeout: Duration,
    /// Emit one warning once a handle has been polling this long.
    pub long_wait_warning: Duration,
    /// Consecutive transport or 5xx failures tolerated.
    pub max_error_retries: u32,
    /// Rate-limit window applied on a 429 without `Retry-After`.
    pub rate_limit_fallback: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::exponential(Duration::from_millis(500), Duration::from_secs(8)),
            progress_timeout: Duration::from_secs(30 * 60),
            long_wait_warning: Duration::from_secs(120),
            max_error_retries: 10,
            rate_limit_fallback: Duration::from_secs(1),
        }
    }
}

/// Outcome of a single poll.
#[derive(Debug)]
enum PollStep {
    Resolved(Value),
    Pending,
    Throttled(Option<Duration>),
    Transient(CoreError),
    /// Stops this await. Whether later awaits see it too is decided by
    /// [`is_cacheable`].
    Terminal(CoreError),
}

impl PollStep {
    fn verdict(&self) -> Verdict {
        match self {
            PollStep::Resolved(_) => Verdict::Success,
            PollStep::Terminal(_) => Verdict::Fatal,
            // The shared window does the waiting before the next poll.
            PollStep::Throttled(_) => Verdict::RetryAfter(Duration::ZERO),
            PollStep::Pending | PollStep::Transient(_) => Verdict::Retry,
        }
    }
}

/// Drives a [`PromiseHandle`] to a terminal result.
pub struct FuturePoller<'a, T: Transport> {
    transport: &'a T,
    pool: Arc<T::Pool>,
    rate_limit: Arc<RateLimitEntry>,
    observer: &'a dyn QueueStateObserver,
    telemetry: &'a dyn TelemetrySink,
    settings: &'a PollerSettings,
}

impl<'a, T: Transport> FuturePoller<'a, T> {
    pub fn new(
        transport: &'a T,
        pool: Arc<T::Pool>,
        rate_limit: Arc<RateLimitEntry>,
        observer: &'a dyn QueueStateObserver,
        telemetry: &'a dyn TelemetrySink,
        settings: &'a PollerSettings,
    ) -> Self {
        Self {
            transport,
            pool,
            rate_limit,
            observer,
            telemetry,
            settings,
        }
    }

    /// Result of the job behind `handle`.
    ///
    /// Returns the cached result without polling once the handle is
    /// terminal. Cancellation, progress timeouts and exhausted error retries
    /// are not cached: a later call resumes polling.
    pub async fn await_result(
        &self,
        handle: &PromiseHandle,
        cancel: &CancellationToken,
    ) -> Result<Value, CoreError> {
        let cached = handle
            .result
            .get_or_try_init(|| async {
                match self.poll_until_terminal(handle, cancel).await {
                    Ok(value) => Ok(Ok(value)),
                    Err(e) if is_cacheable(&e) => Ok(Err(e)),
                    Err(e) => Err(e),
                }
            })
            .await?;
        cached.clone()
    }

    async fn poll_until_terminal(
        &self,
        handle: &PromiseHandle,
        cancel: &CancellationToken,
    ) -> Result<Value, CoreError> {
        let settings = RetrySettings::default()
            .with_max_retries(u32::MAX)
            .with_progress_timeout(self.settings.progress_timeout)
            .with_backoff(self.settings.backoff.clone());
        let started = Instant::now();
        let errors = AtomicU32::new(0);
        let warned = AtomicBool::new(false);
        let (errors, warned) = (&errors, &warned);

        let outcome = RetryHandler::new(settings)
            .run(
                move |ctx| self.poll_once(handle, ctx, errors, warned, started, cancel),
                PollStep::verdict,
                cancel,
            )
            .await?;

        match (outcome.result, outcome.stop) {
            (PollStep::Resolved(value), _) => Ok(value),
            (PollStep::Terminal(e), _) => Err(e),
            (_, StopReason::ProgressStalled) => {
                let status = handle.status();
                Err(CoreError::ProgressTimeout {
                    request_id: handle.request_id().to_string(),
                    waited: outcome.state.progress.since_last(),
                    last_state: status.queue_state,
                    last_reason: status.reason,
                })
            }
            (PollStep::Transient(e), _) => Err(e),
            (PollStep::Throttled(retry_after), _) => Err(CoreError::RateLimited { retry_after }),
            (PollStep::Pending, _) => {
                let status = handle.status();
                Err(CoreError::QueueBusy {
                    queue_state: status.queue_state,
                    reason: status.reason,
                })
            }
        }
    }

    async fn poll_once(
        &self,
        handle: &PromiseHandle,
        ctx: AttemptContext,
        errors: &AtomicU32,
        warned: &AtomicBool,
        started: Instant,
        cancel: &CancellationToken,
    ) -> PollStep {
        if let Err(e) = self.rate_limit.wait(cancel).await {
            return PollStep::Terminal(e);
        }

        let sent = self
            .transport
            .send(Arc::clone(&self.pool), handle.request().clone(), cancel)
            .await;
        handle.record_poll();

        let step = match sent {
            Ok(resp) => self.interpret(handle, &ctx, resp),
            Err(e) if e.is_retryable() => PollStep::Transient(e),
            Err(e) => PollStep::Terminal(e),
        };

        match &step {
            PollStep::Transient(e) => {
                let n = errors.fetch_add(1, Ordering::AcqRel) + 1;
                handle.update(|s| {
                    s.state = QueueState::Retry;
                    s.last_error = Some(e.to_string());
                });
                debug!(request_id = handle.request_id(), consecutive = n, error = %e, "poll failed");
                if n > self.settings.max_error_retries {
                    return PollStep::Terminal(e.clone());
                }
            }
            _ => errors.store(0, Ordering::Release),
        }

        if !matches!(step, PollStep::Resolved(_) | PollStep::Terminal(_)) {
            self.warn_if_long(handle, started, warned);
        }
        step
    }

    fn interpret(&self, handle: &PromiseHandle, ctx: &AttemptContext, resp: HttpResponse) -> PollStep {
        match resp.status {
            200..=299 => {
                let body: Value = match serde_json::from_slice(&resp.body) {
                    Ok(v) => v,
                    Err(_) => Value::String(resp.text()),
                };
                if body.get("type").and_then(Value::as_str) == Some("try_again") {
                    return self.pending(handle, ctx, &body);
                }
                handle.update(|s| s.state = QueueState::Ready);
                PollStep::Resolved(body)
            }
            408 => {
                let body: Value = serde_json::from_slice(&resp.body).unwrap_or(Value::Null);
                self.pending(handle, ctx, &body)
            }
            410 => {
                handle.update(|s| s.state = QueueState::Expired);
                PollStep::Terminal(CoreError::PromiseExpired {
                    request_id: handle.request_id().to_string(),
                })
            }
            429 => {
                let hint = resp.retry_after();
                self.rate_limit
                    .set(hint.unwrap_or(self.settings.rate_limit_fallback));
                handle.update(|s| s.state = QueueState::Retry);
                PollStep::Throttled(hint)
            }
            500..=599 => PollStep::Transient(CoreError::TransientNetwork {
                status: Some(resp.status),
                message: resp.text(),
            }),
            status => PollStep::Terminal(CoreError::UserError {
                status,
                body: resp.text(),
            }),
        }
    }

    fn pending(&self, handle: &PromiseHandle, ctx: &AttemptContext, body: &Value) -> PollStep {
        let queue_state = body.get("queue_state").and_then(Value::as_str);
        let reason = body.get("queue_state_reason").and_then(Value::as_str);
        let changed = handle.update(|s| {
            s.state = QueueState::Pending;
            s.last_error = None;
            let changed = s.queue_state.as_deref() != queue_state || s.reason.as_deref() != reason;
            if changed {
                s.queue_state = queue_state.map(str::to_string);
                s.reason = reason.map(str::to_string);
            }
            changed
        });
        if changed {
            ctx.progress.mark();
        }
        self.observer
            .on_queue_state(handle.request_id(), queue_state, reason);
        PollStep::Pending
    }

    fn warn_if_long(&self, handle: &PromiseHandle, started: Instant, warned: &AtomicBool) {
        let waited = started.elapsed();
        if waited < self.settings.long_wait_warning || warned.swap(true, Ordering::AcqRel) {
            return;
        }
        let status = handle.status();
        warn!(
            request_id = handle.request_id(),
            waited_secs = waited.as_secs(),
            queue_state = status.queue_state.as_deref().unwrap_or("-"),
            reason = status.reason.as_deref().unwrap_or("-"),
            "request has been waiting a long time"
        );
        let mut event = TelemetryEvent::new("promise_long_wait", Severity::Warning)
            .with("request_id", handle.request_id())
            .with("waited_ms", waited.as_millis() as u64);
        if let Some(state) = status.queue_state {
            event = event.with("queue_state", state);
        }
        if let Some(reason) = status.reason {
            event = event.with("queue_state_reason", reason);
        }
        self.telemetry.emit(event);
    }
}

/// Whether a failure is final for the handle, not just for this await.
fn is_cacheable(e: &CoreError) -> bool {
    matches!(
        e,
        CoreError::PromiseExpired { .. } | CoreError::UserError { .. }
    )
}
