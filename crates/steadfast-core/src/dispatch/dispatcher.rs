use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::breaker::CircuitRegistry;
use crate::error::CoreError;
use crate::poller::{DebouncedObserver, FuturePoller, PromiseHandle, QueueStateObserver};
use crate::pool::{PoolKey, PoolRouter, TrafficClass};
use crate::rate_limit::RateLimitWindow;
use crate::retry::{classify_http_status, status_verdict, ErrorKind, RetryHandler, StopReason, Verdict};
use crate::semaphore::{CountingPermit, CountingSemaphore, WeightedPermit, WeightedSemaphore};
use crate::sse::{ServerSentEvent, SseDecoder};
use crate::telemetry::{capture, TelemetrySink, TracingSink};
use crate::transport::{HttpRequest, HttpResponse, Transport};

use super::call::{CallSpec, DispatchSettings};

type EventFn = Box<dyn FnMut(ServerSentEvent) + Send>;

/// Receives events as they are decoded from a stream.
#[derive(Clone)]
struct EventSink {
    deliver: Arc<Mutex<EventFn>>,
    /// Set once the caller has seen an event; the call is not retried after.
    delivered: Arc<AtomicBool>,
}

impl EventSink {
    fn new(on_event: impl FnMut(ServerSentEvent) + Send + 'static) -> Self {
        Self {
            deliver: Arc::new(Mutex::new(Box::new(on_event))),
            delivered: Arc::new(AtomicBool::new(false)),
        }
    }

    fn emit(&self, event: ServerSentEvent) {
        self.delivered.store(true, Ordering::Release);
        let mut deliver = self.deliver.lock().unwrap_or_else(PoisonError::into_inner);
        (*deliver)(event);
    }
}

#[derive(Clone)]
enum Mode {
    Buffered,
    Stream(EventSink),
}

/// Runs calls through routing, circuit, rate-limit, semaphore and retry
/// policy, and polls asynchronous jobs to completion.
pub struct Dispatcher<T: Transport> {
    transport: Arc<T>,
    router: PoolRouter<T::Pool>,
    breakers: CircuitRegistry,
    rate_limits: RateLimitWindow,
    connections: CountingSemaphore,
    bytes: WeightedSemaphore,
    observer: Arc<dyn QueueStateObserver>,
    telemetry: Arc<dyn TelemetrySink>,
    settings: DispatchSettings,
}

impl<T: Transport> fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("router", &self.router)
            .field("breakers", &self.breakers)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: T, settings: DispatchSettings) -> Self {
        let transport = Arc::new(transport);
        let opener = Arc::clone(&transport);
        Self {
            router: PoolRouter::new(move |key: &PoolKey| opener.open_pool(key)),
            transport,
            breakers: CircuitRegistry::new(settings.breaker),
            rate_limits: RateLimitWindow::new(),
            connections: CountingSemaphore::new(),
            bytes: WeightedSemaphore::new(settings.byte_budget),
            observer: Arc::new(DebouncedObserver::default()),
            telemetry: Arc::new(TracingSink),
            settings,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn QueueStateObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn router(&self) -> &PoolRouter<T::Pool> {
        &self.router
    }

    pub fn breakers(&self) -> &CircuitRegistry {
        &self.breakers
    }

    pub fn rate_limits(&self) -> &RateLimitWindow {
        &self.rate_limits
    }

    pub fn connections(&self) -> &CountingSemaphore {
        &self.connections
    }

    pub fn bytes(&self) -> &WeightedSemaphore {
        &self.bytes
    }

    /// Perform `call` and buffer the response. Non-2xx final responses are
    /// returned as the matching [`CoreError`].
    pub async fn execute(
        &self,
        call: CallSpec,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, CoreError> {
        capture(
            self.telemetry.as_ref(),
            "execute",
            self.run(&call, Mode::Buffered, cancel),
        )
        .await
    }

    /// Perform `call` and hand each event of its `text/event-stream` body to
    /// `on_event` as soon as it is decoded. Once an event has been delivered
    /// a failure ends the call instead of retrying it, so no event is seen
    /// twice.
    pub async fn execute_stream_with<F>(
        &self,
        call: CallSpec,
        cancel: &CancellationToken,
        on_event: F,
    ) -> Result<HttpResponse, CoreError>
    where
        F: FnMut(ServerSentEvent) + Send + 'static,
    {
        capture(self.telemetry.as_ref(), "execute_stream", async {
            let response = self
                .run(&call, Mode::Stream(EventSink::new(on_event)), cancel)
                .await?;
            if !response.is_event_stream() {
                return Err(CoreError::InvalidResponse(format!(
                    "expected text/event-stream, got {}",
                    response.header("content-type").unwrap_or("no content type")
                )));
            }
            Ok(response)
        })
        .await
    }

    /// [`execute_stream_with`](Self::execute_stream_with), collecting every
    /// event until the stream ends.
    pub async fn execute_stream(
        &self,
        call: CallSpec,
        cancel: &CancellationToken,
    ) -> Result<Vec<ServerSentEvent>, CoreError> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        self.execute_stream_with(call, cancel, move |event| {
            sink.lock().unwrap_or_else(PoisonError::into_inner).push(event);
        })
        .await?;
        let events = std::mem::take(&mut *events.lock().unwrap_or_else(PoisonError::into_inner));
        Ok(events)
    }

    /// Handle for a job the server accepted as `request_id`. `poll` is the
    /// request that retrieves its result.
    pub fn promise(
        &self,
        request_id: impl Into<String>,
        poll: HttpRequest,
    ) -> Result<PromiseHandle, CoreError> {
        let key = PoolKey::for_origin(&poll.url, TrafficClass::Futures)?;
        Ok(PromiseHandle::new(request_id, key, poll))
    }

    /// Poll `handle` until it resolves or fails terminally.
    pub async fn await_promise(
        &self,
        handle: &PromiseHandle,
        cancel: &CancellationToken,
    ) -> Result<Value, CoreError> {
        let key = handle.pool_key();
        let poller = FuturePoller::new(
            self.transport.as_ref(),
            self.router.resolve_key(key),
            self.rate_limits.for_key(key.destination()),
            self.observer.as_ref(),
            self.telemetry.as_ref(),
            &self.settings.poller,
        );
        capture(
            self.telemetry.as_ref(),
            "await_promise",
            poller.await_result(handle, cancel),
        )
        .await
    }

    /// [`await_promise`](Self::await_promise), deserialized.
    pub async fn await_promise_as<R: DeserializeOwned>(
        &self,
        handle: &PromiseHandle,
        cancel: &CancellationToken,
    ) -> Result<R, CoreError> {
        let value = self.await_promise(handle, cancel).await?;
        serde_json::from_value(value).map_err(|e| {
            CoreError::InvalidResponse(format!(
                "result of {} has unexpected shape: {e}",
                handle.request_id()
            ))
        })
    }

    async fn run(
        &self,
        call: &CallSpec,
        mode: Mode,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, CoreError> {
        let key = PoolKey::for_origin(&call.request.url, call.class)?;
        let pool = self.router.resolve_key(&key);
        let delivered = match &mode {
            Mode::Stream(sink) => Some(Arc::clone(&sink.delivered)),
            Mode::Buffered => None,
        };
        let (key, pool, mode) = (&key, &pool, &mode);

        let classify = move |result: &Result<HttpResponse, CoreError>| match result {
            Err(_) if delivered.as_ref().is_some_and(|d| d.load(Ordering::Acquire)) => {
                Verdict::Fatal
            }
            _ => classify_exchange(result),
        };
        let outcome = RetryHandler::new(self.settings.retry.clone())
            .run(
                move |_| self.attempt(key, pool, call, mode, cancel),
                classify,
                cancel,
            )
            .await?;

        if !matches!(outcome.stop, StopReason::Succeeded | StopReason::Fatal) {
            debug!(
                pool = %key,
                attempts = outcome.state.attempt + 1,
                stop = ?outcome.stop,
                "call gave up"
            );
        }
        match outcome.result {
            Ok(response) if response.is_success() => Ok(response),
            Ok(response) => Err(status_error(&response)),
            Err(e) => Err(e),
        }
    }

    async fn attempt(
        &self,
        key: &PoolKey,
        pool: &Arc<T::Pool>,
        call: &CallSpec,
        mode: &Mode,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, CoreError> {
        let destination = key.destination();
        let permit = self.breakers.admit(destination)?;
        let window = self.rate_limits.for_key(destination);
        window.wait(cancel).await?;

        let slot = self
            .connections
            .acquire_blocking(
                &key.to_string_key(),
                self.settings.max_connections,
                &self.settings.retry.backoff,
                self.settings.acquire_timeout,
                cancel,
            )
            .await?;
        let bytes = self
            .bytes
            .acquire(destination, call.weight, self.settings.acquire_timeout, cancel)
            .await?;

        let sent = self.exchange(pool, call, mode, (slot, bytes), cancel).await;

        match &sent {
            Ok(resp) => {
                if resp.status == 429 {
                    window.set(resp.retry_after().unwrap_or(self.settings.rate_limit_fallback));
                }
                if !resp.is_success() && classify_http_status(resp.status).trips_circuit() {
                    permit.failure();
                } else {
                    permit.success();
                }
            }
            Err(CoreError::TransientNetwork { .. }) => permit.failure(),
            // Not a verdict on the destination; a probe slot is freed on drop.
            Err(_) => drop(permit),
        }
        sent
    }

    /// Run the transport call on its own task, which owns `permits` until the
    /// transfer has really ended. If this future is dropped first the task is
    /// cancelled, and the slot and bytes are released only once the
    /// connection is gone.
    async fn exchange(
        &self,
        pool: &Arc<T::Pool>,
        call: &CallSpec,
        mode: &Mode,
        permits: (CountingPermit, WeightedPermit),
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, CoreError> {
        let transport = Arc::clone(&self.transport);
        let pool = Arc::clone(pool);
        let request = call.request.clone();
        let mode = mode.clone();
        let cancel = cancel.child_token();
        let _abandon = cancel.clone().drop_guard();

        let task = tokio::spawn(async move {
            let _permits = permits;
            match mode {
                Mode::Buffered => transport.send(pool, request, &cancel).await,
                Mode::Stream(sink) => {
                    stream_events(transport.as_ref(), pool, request, sink, &cancel).await
                }
            }
        });
        task.await
            .map_err(|e| CoreError::transient(format!("dispatch task failed: {e}")))?
    }
}

async fn stream_events<T: Transport>(
    transport: &T,
    pool: Arc<T::Pool>,
    request: HttpRequest,
    sink: EventSink,
    cancel: &CancellationToken,
) -> Result<HttpResponse, CoreError> {
    let decoder = Arc::new(Mutex::new(SseDecoder::new()));
    let feed = Arc::clone(&decoder);
    let deliver = sink.clone();
    let response = transport
        .stream(
            pool,
            request,
            move |chunk: &[u8]| {
                let events = feed.lock().unwrap_or_else(PoisonError::into_inner).feed(chunk);
                for event in events {
                    deliver.emit(event);
                }
            },
            cancel,
        )
        .await?;

    let last = decoder.lock().unwrap_or_else(PoisonError::into_inner).finish();
    if let Some(event) = last {
        sink.emit(event);
    }
    Ok(response)
}

fn classify_exchange(result: &Result<HttpResponse, CoreError>) -> Verdict {
    match result {
        Ok(response) => status_verdict(response.status, response.retry_after()),
        Err(e) if e.is_retryable() => Verdict::Retry,
        Err(_) => Verdict::Fatal,
    }
}

/// Final error for a non-2xx response.
fn status_error(resp: &HttpResponse) -> CoreError {
    match classify_http_status(resp.status) {
        ErrorKind::Throttled => CoreError::RateLimited {
            retry_after: resp.retry_after(),
        },
        ErrorKind::Http5xx(_) | ErrorKind::RequestTimeout => CoreError::TransientNetwork {
            status: Some(resp.status),
            message: resp.text(),
        },
        ErrorKind::Other => {
            CoreError::InvalidResponse(format!("unexpected HTTP {}", resp.status))
        }
        _ => CoreError::UserError {
            status: resp.status,
            body: resp.text(),
        },
    }
}
