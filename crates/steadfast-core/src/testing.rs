//! In-process transport for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::pool::PoolKey;
use crate::transport::{HttpRequest, HttpResponse, Transport};

/// Replays a fixed script of responses; the last entry repeats once the
/// script runs out.
#[derive(Debug, Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Result<HttpResponse, CoreError>>>,
    calls: AtomicUsize,
    opened: AtomicUsize,
    delay: Option<Duration>,
    pub(crate) seen: Mutex<Vec<(PoolKey, HttpRequest)>>,
}

impl ScriptedTransport {
    pub(crate) fn new(script: Vec<Result<HttpResponse, CoreError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn pools_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn next(&self) -> Result<HttpResponse, CoreError> {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script
                .front()
                .cloned()
                .unwrap_or_else(|| Err(CoreError::transient("script empty")))
        }
    }
}

impl Transport for ScriptedTransport {
    type Pool = PoolKey;

    fn open_pool(&self, key: &PoolKey) -> PoolKey {
        self.opened.fetch_add(1, Ordering::SeqCst);
        key.clone()
    }

    async fn send(
        &self,
        pool: Arc<PoolKey>,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(((*pool).clone(), request));
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.next()
    }

    async fn stream<F>(
        &self,
        pool: Arc<PoolKey>,
        request: HttpRequest,
        mut on_chunk: F,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, CoreError>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let mut resp = self.send(pool, request, cancel).await?;
        if resp.is_success() && resp.is_event_stream() {
            // Deliver the body in small pieces to exercise reassembly.
            for piece in resp.body.chunks(5) {
                on_chunk(piece);
            }
            resp.body.clear();
        }
        Ok(resp)
    }
}

pub(crate) fn event_stream(body: &str) -> Result<HttpResponse, CoreError> {
    Ok(HttpResponse::new(200)
        .with_header("Content-Type", "text/event-stream")
        .with_body(body))
}

pub(crate) fn json(status: u16, body: serde_json::Value) -> Result<HttpResponse, CoreError> {
    Ok(HttpResponse::new(status)
        .with_header("Content-Type", "application/json")
        .with_body(body.to_string()))
}
