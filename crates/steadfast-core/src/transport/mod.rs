//! The seam between the core and the wire.
//!
//! The core never opens sockets itself. A [`Transport`] opens one pool per
//! [`PoolKey`] and sends requests over it; [`CurlTransport`] is the libcurl
//! implementation used by the CLI and the integration tests.

mod curl;
mod http;

pub use self::curl::{CurlPool, CurlTransport};
pub use self::http::{HttpRequest, HttpResponse};

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::pool::PoolKey;

/// Sends requests over per-key pools.
///
/// `send` and `stream` resolve to `Ok` for every HTTP status; status
/// classification is the caller's job. `Err` means no response was received.
///
/// When `cancel` fires the exchange is abandoned and resolves to
/// `Err(CoreError::Cancelled)` only once the underlying connection has been
/// let go of.
pub trait Transport: Send + Sync + 'static {
    /// Pool handle, created once per [`PoolKey`] and shared by all requests
    /// routed to that key.
    type Pool: Send + Sync + 'static;

    fn open_pool(&self, key: &PoolKey) -> Self::Pool;

    /// Send `request` and buffer the whole response body.
    fn send(
        &self,
        pool: Arc<Self::Pool>,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<HttpResponse, CoreError>> + Send;

    /// Send `request` and hand each body chunk of a 2xx `text/event-stream`
    /// response to `on_chunk` as it arrives. The returned response carries
    /// the status and headers; any other body is buffered into it as usual.
    fn stream<F>(
        &self,
        pool: Arc<Self::Pool>,
        request: HttpRequest,
        on_chunk: F,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<HttpResponse, CoreError>> + Send
    where
        F: FnMut(&[u8]) + Send + 'static;
}
