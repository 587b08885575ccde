//! Polling of asynchronous server-side jobs.
//!
//! A job submitted to the service answers with a request id; the result is
//! fetched later by polling. Each [`PromiseHandle`] moves through
//!
//! ```text
//! dispatched -> polling -> {pending, retry} -> polling -> ...
//!                       \-> ready (resolved, cached)
//!                       \-> expired (410, cached; resubmit)
//! ```
//!
//! Polls for one handle are strictly sequential. The terminal result is
//! cached on the handle so later awaits never touch the network.

mod handle;
mod observer;
mod poll;

pub use handle::{PromiseHandle, PromiseStatus, QueueState};
pub use observer::{DebouncedObserver, LoggingObserver, QueueStateObserver};
pub use poll::{FuturePoller, PollerSettings};
