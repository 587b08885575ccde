//! Error taxonomy for calls made through the core.
//!
//! Every failure that leaves the core is one of these variants. Retry,
//! backoff and circuit decisions are made before an error is returned, so a
//! caller only ever sees a final, classified failure.

use std::time::Duration;

use thiserror::Error;

/// Classified failure of a call, poll or wait.
///
/// `Clone` so that a terminal result cached on a promise can be handed to
/// every awaiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Network-level failure or a retryable server status (5xx, 408) that
    /// outlived the retry budget.
    #[error("transient network failure{}: {message}", fmt_status(.status))]
    TransientNetwork {
        status: Option<u16>,
        message: String,
    },

    /// The destination answered 429 and the retry budget ran out while backing off.
    #[error("rate limited{}", fmt_retry_after(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// The server keeps reporting the job as queued.
    #[error("queue busy (state={}, reason={})", opt(.queue_state), opt(.reason))]
    QueueBusy {
        queue_state: Option<String>,
        reason: Option<String>,
    },

    /// The server discarded the promise; the request must be resubmitted.
    #[error("promise {request_id} expired; resubmit the request")]
    PromiseExpired { request_id: String },

    /// Non-retryable client error (4xx other than 408/429).
    #[error("HTTP {status}: {body}")]
    UserError { status: u16, body: String },

    /// The destination's circuit is open; no request was sent.
    #[error("circuit open for {key} (retry in {:?})", .retry_in)]
    CircuitOpen { key: String, retry_in: Duration },

    /// A poll saw no queue-state change for longer than the progress timeout.
    #[error(
        "no progress on {request_id} for {:?} (last state={}, reason={})",
        .waited,
        opt(.last_state),
        opt(.last_reason)
    )]
    ProgressTimeout {
        request_id: String,
        waited: Duration,
        last_state: Option<String>,
        last_reason: Option<String>,
    },

    /// A semaphore or byte budget could not be acquired before the deadline.
    #[error("overloaded: {resource} unavailable after {:?}", .waited)]
    Overloaded { resource: String, waited: Duration },

    /// The caller cancelled the wait.
    #[error("cancelled")]
    Cancelled,

    /// A base address could not be normalized into a pool key.
    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The server answered with a body the core could not interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl CoreError {
    /// Whether retrying the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::TransientNetwork { .. }
                | CoreError::RateLimited { .. }
                | CoreError::QueueBusy { .. }
                | CoreError::Overloaded { .. }
        )
    }

    /// HTTP status attached to the failure, if one was observed.
    pub fn status(&self) -> Option<u16> {
        match self {
            CoreError::TransientNetwork { status, .. } => *status,
            CoreError::RateLimited { .. } => Some(429),
            CoreError::PromiseExpired { .. } => Some(410),
            CoreError::UserError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Short machine-readable name used in telemetry events.
    pub fn kind_name(&self) -> &'static str {
        match self {
            CoreError::TransientNetwork { .. } => "transient_network",
            CoreError::RateLimited { .. } => "rate_limited",
            CoreError::QueueBusy { .. } => "queue_busy",
            CoreError::PromiseExpired { .. } => "promise_expired",
            CoreError::UserError { .. } => "user_error",
            CoreError::CircuitOpen { .. } => "circuit_open",
            CoreError::ProgressTimeout { .. } => "progress_timeout",
            CoreError::Overloaded { .. } => "overloaded",
            CoreError::Cancelled => "cancelled",
            CoreError::InvalidAddress { .. } => "invalid_address",
            CoreError::InvalidResponse(_) => "invalid_response",
        }
    }

    pub(crate) fn transient(message: impl Into<String>) -> Self {
        CoreError::TransientNetwork {
            status: None,
            message: message.into(),
        }
    }
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

fn fmt_retry_after(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(" (retry after {d:?})"))
        .unwrap_or_default()
}

fn opt(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(CoreError::transient("reset").is_retryable());
        assert!(CoreError::RateLimited { retry_after: None }.is_retryable());
        assert!(!CoreError::UserError {
            status: 404,
            body: String::new()
        }
        .is_retryable());
        assert!(!CoreError::PromiseExpired {
            request_id: "r1".into()
        }
        .is_retryable());
        assert!(!CoreError::Cancelled.is_retryable());
    }

    #[test]
    fn status_reported_for_http_failures() {
        let e = CoreError::TransientNetwork {
            status: Some(503),
            message: "unavailable".into(),
        };
        assert_eq!(e.status(), Some(503));
        assert_eq!(
            CoreError::PromiseExpired {
                request_id: "r".into()
            }
            .status(),
            Some(410)
        );
        assert_eq!(CoreError::Cancelled.status(), None);
    }

    #[test]
    fn display_includes_last_reason() {
        let e = CoreError::ProgressTimeout {
            request_id: "req-7".into(),
            waited: Duration::from_secs(120),
            last_state: Some("pending".into()),
            last_reason: Some("waiting for capacity".into()),
        };
        let s = e.to_string();
        assert!(s.contains("req-7"));
        assert!(s.contains("waiting for capacity"));
    }
}
