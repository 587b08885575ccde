//! Circuit record and its state transitions.

use std::time::{Duration, Instant};

/// Breaker shape shared by every key in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before admitting a probe.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker state for one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    pub probe_in_flight: bool,
}

impl Default for CircuitRecord {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Admission {
    Normal,
    Probe,
}

impl CircuitRecord {
    /// State as a caller would observe it now: an open circuit whose reset
    /// timeout has elapsed reports `HalfOpen`.
    pub fn effective_state(&self, now: Instant, cfg: &BreakerConfig) -> CircuitState {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(at)) if now.duration_since(at) >= cfg.reset_timeout => {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    /// Admit a call or return how long until a probe would be allowed.
    pub(super) fn admit(&mut self, now: Instant, cfg: &BreakerConfig) -> Result<Admission, Duration> {
        match self.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let opened = self.opened_at.unwrap_or(now);
                let since = now.duration_since(opened);
                if since < cfg.reset_timeout {
                    return Err(cfg.reset_timeout - since);
                }
                self.state = CircuitState::HalfOpen;
                self.probe_in_flight = true;
                Ok(Admission::Probe)
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Err(Duration::ZERO)
                } else {
                    self.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    /// Returns true when this success closed the circuit.
    pub(super) fn on_success(&mut self, admission: Admission) -> bool {
        match admission {
            Admission::Probe => {
                self.state = CircuitState::Closed;
                self.consecutive_failures = 0;
                self.opened_at = None;
                self.probe_in_flight = false;
                true
            }
            Admission::Normal => {
                if self.state == CircuitState::Closed {
                    self.consecutive_failures = 0;
                }
                false
            }
        }
    }

    /// Returns true when this failure opened (or re-opened) the circuit.
    pub(super) fn on_failure(
        &mut self,
        admission: Admission,
        now: Instant,
        cfg: &BreakerConfig,
    ) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match admission {
            Admission::Probe => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
                self.probe_in_flight = false;
                true
            }
            Admission::Normal => {
                if self.state == CircuitState::Closed
                    && self.consecutive_failures >= cfg.failure_threshold.max(1)
                {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                    return true;
                }
                false
            }
        }
    }

    /// A probe ended without reporting (its future was dropped).
    pub(super) fn abandon_probe(&mut self) {
        self.probe_in_flight = false;
    }
}
