//! libcurl transport.
//!
//! Each pool keeps a small stack of idle `Easy` handles. libcurl caches
//! connections per handle, so reusing handles within a pool reuses
//! connections, and keeping pools per [`PoolKey`] keeps traffic classes from
//! sharing them. Transfers run on the blocking thread pool.
//!
//! Cancellation sets an abort flag that the progress and write callbacks
//! check, so libcurl drops the connection within about a second instead of
//! running the transfer to completion on its own.

use std::cell::Cell;
use std::fmt;
use std::str;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ::curl::easy::{Easy, List};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::CoreError;
use crate::pool::PoolKey;
use crate::retry::{classify_curl_error, ErrorKind};

use super::{HttpRequest, HttpResponse, Transport};

type ChunkSink = Box<dyn FnMut(&[u8]) + Send>;

/// Idle handles for one pool key.
pub struct CurlPool {
    key: PoolKey,
    idle: Mutex<Vec<Easy>>,
    max_idle: usize,
}

impl fmt::Debug for CurlPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CurlPool")
            .field("key", &self.key)
            .field("idle", &self.idle_count())
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

impl CurlPool {
    pub fn new(key: PoolKey, max_idle: usize) -> Self {
        Self {
            key,
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn checkout(&self) -> Easy {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(Easy::new)
    }

    fn checkin(&self, mut easy: Easy) {
        // reset() clears options but keeps the connection cache.
        easy.reset();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(easy);
        }
    }
}

/// [`Transport`] backed by libcurl.
#[derive(Debug, Clone)]
pub struct CurlTransport {
    connect_timeout: Duration,
    request_timeout: Duration,
    max_idle: usize,
}

impl Default for CurlTransport {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(60),
            max_idle: 8,
        }
    }
}

impl CurlTransport {
    pub fn new(max_idle: usize) -> Self {
        Self {
            max_idle,
            ..Self::default()
        }
    }

    /// `request` bounds buffered sends only; streams run until the server
    /// closes them.
    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }
}

impl Transport for CurlTransport {
    type Pool = CurlPool;

    fn open_pool(&self, key: &PoolKey) -> CurlPool {
        CurlPool::new(key.clone(), self.max_idle)
    }

    async fn send(
        &self,
        pool: Arc<CurlPool>,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, CoreError> {
        let timeouts = (self.connect_timeout, Some(self.request_timeout));
        run_blocking(cancel, move |abort| {
            perform(&pool, &request, timeouts, None, abort)
        })
        .await
    }

    async fn stream<F>(
        &self,
        pool: Arc<CurlPool>,
        request: HttpRequest,
        on_chunk: F,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, CoreError>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let timeouts = (self.connect_timeout, None);
        let sink: ChunkSink = Box::new(on_chunk);
        run_blocking(cancel, move |abort| {
            perform(&pool, &request, timeouts, Some(sink), abort)
        })
        .await
    }
}

/// Raises the abort flag when dropped, so a transfer whose caller went away
/// stops too.
struct AbortOnDrop(Arc<AtomicBool>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

async fn run_blocking<F>(cancel: &CancellationToken, work: F) -> Result<HttpResponse, CoreError>
where
    F: FnOnce(&AtomicBool) -> Result<HttpResponse, CoreError> + Send + 'static,
{
    let abort = AbortOnDrop(Arc::new(AtomicBool::new(false)));
    let flag = Arc::clone(&abort.0);
    let mut task = tokio::task::spawn_blocking(move || work(flag.as_ref()));

    let joined = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            abort.0.store(true, Ordering::Relaxed);
            // Resolve only once libcurl has actually let go of the connection.
            let _ = task.await;
            debug!("transfer aborted");
            return Err(CoreError::Cancelled);
        }
        joined = &mut task => joined,
    };
    joined.map_err(|e| CoreError::transient(format!("transport task failed: {e}")))?
}

fn perform(
    pool: &CurlPool,
    request: &HttpRequest,
    (connect_timeout, request_timeout): (Duration, Option<Duration>),
    sink: Option<ChunkSink>,
    abort: &AtomicBool,
) -> Result<HttpResponse, CoreError> {
    let mut easy = pool.checkout();
    let result = transfer(&mut easy, request, connect_timeout, request_timeout, sink, abort);
    pool.checkin(easy);
    if let Ok(resp) = &result {
        trace!(pool = %pool.key(), method = %request.method, url = %request.url, status = resp.status, "exchange complete");
    }
    result
}

fn transfer(
    easy: &mut Easy,
    request: &HttpRequest,
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
    mut sink: Option<ChunkSink>,
    abort: &AtomicBool,
) -> Result<HttpResponse, CoreError> {
    easy.url(&request.url)?;
    easy.follow_location(true)?;
    easy.max_redirections(10)?;
    easy.connect_timeout(connect_timeout)?;
    if let Some(timeout) = request_timeout {
        easy.timeout(timeout)?;
    }
    // Enables the progress callback, which also fires while the connection
    // is idle.
    easy.progress(true)?;

    let method = request.method.to_ascii_uppercase();
    if method == "HEAD" {
        easy.nobody(true)?;
    } else if let Some(body) = &request.body {
        easy.post(true)?;
        easy.post_fields_copy(body)?;
    } else {
        easy.get(true)?;
    }
    if !matches!(method.as_str(), "GET" | "POST" | "HEAD") {
        easy.custom_request(&method)?;
    }

    let mut list = List::new();
    for (name, value) in &request.headers {
        list.append(&format!("{}: {}", name.trim(), value.trim()))?;
    }
    if !request.headers.is_empty() {
        easy.http_headers(list)?;
    }

    let status = Cell::new(0u16);
    let event_stream = Cell::new(false);
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut body: Vec<u8> = Vec::new();
    {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            if let Ok(line) = str::from_utf8(data) {
                let line = line.trim_end();
                if let Some(code) = parse_status_line(line) {
                    // A new status line starts a new response (redirects, 100-continue).
                    status.set(code);
                    event_stream.set(false);
                    headers.clear();
                } else if let Some((name, value)) = line.split_once(':') {
                    let (name, value) = (name.trim(), value.trim());
                    if name.eq_ignore_ascii_case("content-type") {
                        event_stream.set(value.to_ascii_lowercase().starts_with("text/event-stream"));
                    }
                    headers.push((name.to_string(), value.to_string()));
                }
            }
            true
        })?;
        transfer.progress_function(|_, _, _, _| !abort.load(Ordering::Relaxed))?;
        transfer.write_function(|data| {
            if abort.load(Ordering::Relaxed) {
                // A short write makes libcurl fail the transfer.
                return Ok(0);
            }
            let streaming = event_stream.get() && (200..300).contains(&status.get());
            match sink.as_mut() {
                Some(on_chunk) if streaming => on_chunk(data),
                _ => body.extend_from_slice(data),
            }
            Ok(data.len())
        })?;
        if let Err(e) = transfer.perform() {
            if abort.load(Ordering::Relaxed) {
                return Err(CoreError::Cancelled);
            }
            return Err(e.into());
        }
    }

    let code = easy.response_code()?;
    let status = u16::try_from(code)
        .map_err(|_| CoreError::InvalidResponse(format!("status code out of range: {code}")))?;
    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

/// Status code from an `HTTP/x.y NNN reason` line.
fn parse_status_line(line: &str) -> Option<u16> {
    let rest = line.strip_prefix("HTTP/")?;
    let code = rest.split_whitespace().nth(1)?;
    code.parse().ok()
}

impl From<::curl::Error> for CoreError {
    fn from(e: ::curl::Error) -> Self {
        if e.is_url_malformed() || e.is_unsupported_protocol() {
            return CoreError::InvalidAddress {
                address: e.extra_description().unwrap_or_default().to_string(),
                reason: e.description().to_string(),
            };
        }
        let kind = match classify_curl_error(&e) {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            _ => "transfer",
        };
        CoreError::TransientNetwork {
            status: None,
            message: format!("{kind} error: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_parsing() {
        assert_eq!(parse_status_line("HTTP/1.1 200 OK"), Some(200));
        assert_eq!(parse_status_line("HTTP/2 429"), Some(429));
        assert_eq!(parse_status_line("Content-Type: text/plain"), None);
        assert_eq!(parse_status_line("HTTP/1.1 abc"), None);
    }

    #[test]
    fn pool_keeps_at_most_max_idle_handles() {
        let key = PoolKey::new("http://127.0.0.1:9", crate::pool::TrafficClass::Session).unwrap();
        let pool = CurlPool::new(key, 1);
        let a = pool.checkout();
        let b = pool.checkout();
        pool.checkin(a);
        pool.checkin(b);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        let transport = CurlTransport::default()
            .with_timeouts(Duration::from_secs(2), Duration::from_secs(2));
        let key = PoolKey::new("http://127.0.0.1:1", crate::pool::TrafficClass::Session).unwrap();
        let pool = Arc::new(transport.open_pool(&key));
        let err = transport
            .send(pool, HttpRequest::get("http://127.0.0.1:1/"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::TransientNetwork { status: None, .. }));
    }

    #[tokio::test]
    async fn cancelled_before_send_aborts_the_transfer() {
        let transport = CurlTransport::default();
        let key = PoolKey::new("http://127.0.0.1:1", crate::pool::TrafficClass::Session).unwrap();
        let pool = Arc::new(transport.open_pool(&key));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = transport
            .send(pool, HttpRequest::get("http://127.0.0.1:1/"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::Cancelled);
    }

    #[test]
    fn raised_abort_flag_fails_the_transfer_as_cancelled() {
        let key = PoolKey::new("http://127.0.0.1:1", crate::pool::TrafficClass::Session).unwrap();
        let pool = CurlPool::new(key, 1);
        let abort = AtomicBool::new(true);
        let err = perform(
            &pool,
            &HttpRequest::get("http://127.0.0.1:1/"),
            (Duration::from_secs(2), Some(Duration::from_secs(2))),
            None,
            &abort,
        )
        .unwrap_err();
        assert_eq!(err, CoreError::Cancelled);
    }
}
