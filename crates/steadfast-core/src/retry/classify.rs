//! Classify HTTP status and curl errors into retry decisions.

use std::time::Duration;

use super::policy::Verdict;

/// High-level classification of a failed exchange.
///
/// Callers map HTTP status codes and curl errors into these kinds; the
/// dispatcher uses them to pick the error variant and to decide whether a
/// failure counts against the destination's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect or transfer timed out.
    Timeout,
    /// Network-level failure (connection reset, DNS, etc.).
    Connection,
    /// Server asked us to slow down (429).
    Throttled,
    /// 408: server gave up waiting, or an async job is not ready yet.
    RequestTimeout,
    /// 5xx.
    Http5xx(u16),
    /// 410: the resource (usually a promise) no longer exists.
    Gone,
    /// Any other 4xx. Never retried.
    Client(u16),
    /// Anything else (unexpected 1xx/3xx, unknown curl failure).
    Other,
}

impl ErrorKind {
    /// Whether this kind is worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::Connection
                | ErrorKind::Throttled
                | ErrorKind::RequestTimeout
                | ErrorKind::Http5xx(_)
        )
    }

    /// Whether this kind indicates an unhealthy destination (counts toward
    /// opening its circuit). Client errors and rate limiting do not.
    pub fn trips_circuit(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Connection | ErrorKind::Http5xx(_)
        )
    }
}

/// Classify a non-2xx HTTP status code.
pub fn classify_http_status(code: u16) -> ErrorKind {
    match code {
        408 => ErrorKind::RequestTimeout,
        410 => ErrorKind::Gone,
        429 => ErrorKind::Throttled,
        400..=499 => ErrorKind::Client(code),
        500..=599 => ErrorKind::Http5xx(code),
        _ => ErrorKind::Other,
    }
}

/// Classify a curl error.
pub fn classify_curl_error(e: &curl::Error) -> ErrorKind {
    if e.is_operation_timedout() {
        return ErrorKind::Timeout;
    }
    if e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
        || e.is_ssl_connect_error()
    {
        return ErrorKind::Connection;
    }
    ErrorKind::Other
}

/// Default status-code predicate for [`RetryHandler`](super::RetryHandler).
///
/// 2xx succeeds; 5xx and 408 retry with backoff; 429 retries after the
/// server's `Retry-After` hint when present, else with backoff; every other
/// status is terminal.
pub fn status_verdict(status: u16, retry_after: Option<Duration>) -> Verdict {
    if (200..300).contains(&status) {
        return Verdict::Success;
    }
    match classify_http_status(status) {
        ErrorKind::Throttled => match retry_after {
            Some(hint) => Verdict::RetryAfter(hint),
            None => Verdict::Retry,
        },
        kind if kind.is_retryable() => Verdict::Retry,
        _ => Verdict::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_429_throttled() {
        assert_eq!(classify_http_status(429), ErrorKind::Throttled);
    }

    #[test]
    fn http_5xx_retryable() {
        assert!(matches!(classify_http_status(500), ErrorKind::Http5xx(500)));
        assert!(matches!(classify_http_status(503), ErrorKind::Http5xx(503)));
        assert!(classify_http_status(502).is_retryable());
    }

    #[test]
    fn http_408_and_410_are_distinct() {
        assert_eq!(classify_http_status(408), ErrorKind::RequestTimeout);
        assert_eq!(classify_http_status(410), ErrorKind::Gone);
        assert!(classify_http_status(408).is_retryable());
        assert!(!classify_http_status(410).is_retryable());
    }

    #[test]
    fn http_4xx_client() {
        assert_eq!(classify_http_status(404), ErrorKind::Client(404));
        assert_eq!(classify_http_status(403), ErrorKind::Client(403));
        assert!(!classify_http_status(400).is_retryable());
    }

    #[test]
    fn only_server_side_failures_trip_circuit() {
        assert!(classify_http_status(503).trips_circuit());
        assert!(!classify_http_status(429).trips_circuit());
        assert!(!classify_http_status(404).trips_circuit());
    }

    #[test]
    fn status_verdicts() {
        assert_eq!(status_verdict(200, None), Verdict::Success);
        assert_eq!(status_verdict(204, None), Verdict::Success);
        assert_eq!(status_verdict(500, None), Verdict::Retry);
        assert_eq!(status_verdict(408, None), Verdict::Retry);
        assert_eq!(status_verdict(429, None), Verdict::Retry);
        assert_eq!(
            status_verdict(429, Some(Duration::from_secs(3))),
            Verdict::RetryAfter(Duration::from_secs(3))
        );
        assert_eq!(status_verdict(400, None), Verdict::Fatal);
        assert_eq!(status_verdict(410, None), Verdict::Fatal);
    }
}
