//! CLI command handlers, one file per command.

mod backoff;
mod call;
mod config;
mod poll;
mod sse;

pub use backoff::run_backoff;
pub use call::{run_call, CallArgs};
#[cfg(test)]
pub(crate) use call::build_request;
pub use config::run_config;
pub use poll::run_poll;
pub use sse::run_sse;

use steadfast_core::config::CoreConfig;
use steadfast_core::transport::CurlTransport;
use steadfast_core::Dispatcher;
use tokio_util::sync::CancellationToken;

/// Dispatcher over libcurl with settings from `cfg`.
fn dispatcher(cfg: &CoreConfig) -> Dispatcher<CurlTransport> {
    Dispatcher::new(CurlTransport::new(cfg.pool_max_idle), cfg.dispatch_settings())
}

/// Token cancelled on Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, cancelling");
            trigger.cancel();
        }
    });
    token
}
