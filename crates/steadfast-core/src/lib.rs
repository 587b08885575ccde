//! Client-side resilience core for calling remote HTTP services.
//!
//! [`Dispatcher`] is the entry point: it routes each call to an isolated
//! pool, gates it through the destination's circuit breaker, shared
//! rate-limit window and semaphores, retries transient failures with
//! backoff, and polls server-side jobs until they resolve.

pub mod config;
pub mod logging;

pub mod backoff;
pub mod breaker;
pub mod dispatch;
pub mod error;
pub mod poller;
pub mod pool;
pub mod rate_limit;
pub mod retry;
pub mod semaphore;
pub mod sse;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod testing;

pub use dispatch::{CallSpec, DispatchSettings, Dispatcher};
pub use error::CoreError;
pub use pool::{PoolKey, TrafficClass};
