//! Retry engine.
//!
//! This module encapsulates status/transport classification and the
//! attempt loop so that the dispatcher and the future poller share one
//! policy: bounded attempts, an optional total elapsed budget, and an
//! optional progress timeout that stops a stalled loop even when attempts
//! remain.

mod classify;
mod policy;
mod run;
mod state;

pub use classify::{classify_curl_error, classify_http_status, status_verdict, ErrorKind};
pub use policy::{RetryDecision, RetrySettings, StopReason, Verdict};
pub use run::{RetryHandler, RetryOutcome};
pub use state::{AttemptContext, ProgressTracker, RetryState};
