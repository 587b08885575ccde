//! Per-destination circuit breaker.
//!
//! Each destination key has its own [`CircuitRecord`] behind its own mutex,
//! so a failure burst against one backend never serializes callers of
//! another. Transitions:
//!
//! ```text
//! closed    -> open       consecutive failures reach failure_threshold
//! open      -> half_open  reset_timeout elapsed since opening (on next admission)
//! half_open -> closed     probe succeeded; failure count reset to 0
//! half_open -> open       probe failed; open timestamp reset
//! ```
//!
//! Half-open admits exactly one probe. Callers arriving while the probe is in
//! flight fail fast with [`CircuitOpen`](crate::error::CoreError::CircuitOpen)
//! rather than queueing behind it.

mod record;
mod registry;

pub use record::{BreakerConfig, CircuitRecord, CircuitState};
pub use registry::{CircuitPermit, CircuitRegistry};
