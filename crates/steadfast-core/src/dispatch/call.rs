use std::time::Duration;

use crate::breaker::BreakerConfig;
use crate::poller::PollerSettings;
use crate::pool::TrafficClass;
use crate::retry::RetrySettings;
use crate::transport::HttpRequest;

/// One call: what to send, which class it belongs to, and how many payload
/// bytes it is expected to move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSpec {
    pub class: TrafficClass,
    pub request: HttpRequest,
    /// Estimated in-flight payload, charged against the byte budget.
    pub weight: u64,
}

impl CallSpec {
    /// Weight defaults to the request body length.
    pub fn new(class: TrafficClass, request: HttpRequest) -> Self {
        let weight = request.body_len();
        Self {
            class,
            request,
            weight,
        }
    }

    pub fn with_weight(mut self, weight: u64) -> Self {
        self.weight = weight;
        self
    }
}

/// Everything a [`Dispatcher`](super::Dispatcher) needs to know about limits.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub retry: RetrySettings,
    pub breaker: BreakerConfig,
    pub poller: PollerSettings,
    /// Concurrent in-flight calls per pool.
    pub max_connections: usize,
    /// Estimated in-flight payload bytes per destination.
    pub byte_budget: u64,
    /// Rate-limit window applied on a 429 without `Retry-After`.
    pub rate_limit_fallback: Duration,
    /// Give up waiting for a connection slot or byte budget after this long.
    pub acquire_timeout: Option<Duration>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            breaker: BreakerConfig::default(),
            poller: PollerSettings::default(),
            max_connections: 16,
            byte_budget: 64 * 1024 * 1024,
            rate_limit_fallback: Duration::from_secs(1),
            acquire_timeout: None,
        }
    }
}
