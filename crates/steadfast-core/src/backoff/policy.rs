use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::random::{RandomSource, ThreadRandom};

/// How the un-jittered delay grows with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `base * 2^attempt`.
    #[default]
    Exponential,
    /// `base * (attempt + 1)`.
    Linear,
    /// `base` for every attempt.
    Constant,
}

/// Randomisation applied after the delay has been capped.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Jitter {
    #[default]
    None,
    /// `capped + rand * capped * j`: only ever lengthens the delay.
    Additive(f64),
    /// `capped * (1 - j + rand * 2j)`: spreads ±j around the capped delay.
    Multiplicative(f64),
    /// `capped * (lo + rand * (hi - lo))`.
    Bounded { lo: f64, hi: f64 },
}

impl Jitter {
    fn normalized(self) -> Self {
        match self {
            Jitter::None => Jitter::None,
            Jitter::Additive(j) => Jitter::Additive(clamp_factor(j)),
            Jitter::Multiplicative(j) => Jitter::Multiplicative(clamp_factor(j)),
            Jitter::Bounded { lo, hi } => {
                let lo = if lo.is_finite() { lo.max(0.0) } else { 0.0 };
                let hi = if hi.is_finite() { hi.max(lo) } else { lo };
                Jitter::Bounded { lo, hi }
            }
        }
    }

    /// Largest multiple of the capped delay this jitter can produce.
    fn upper_factor(self) -> f64 {
        match self {
            Jitter::None => 1.0,
            Jitter::Additive(j) | Jitter::Multiplicative(j) => 1.0 + j,
            Jitter::Bounded { hi, .. } => hi,
        }
    }
}

fn clamp_factor(j: f64) -> f64 {
    if j.is_finite() {
        j.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Immutable backoff shape: strategy, base, cap, jitter and random source.
///
/// ```
/// use std::time::Duration;
/// use steadfast_core::backoff::BackoffPolicy;
///
/// let policy = BackoffPolicy::exponential(Duration::from_millis(500), Duration::from_secs(8));
/// assert_eq!(policy.delay(0), Duration::from_millis(500));
/// assert_eq!(policy.delay(3), Duration::from_millis(4000));
/// assert_eq!(policy.delay(4), Duration::from_secs(8));
/// ```
#[derive(Clone)]
pub struct BackoffPolicy {
    strategy: BackoffStrategy,
    base: Duration,
    max: Duration,
    jitter: Jitter,
    random: Arc<dyn RandomSource>,
}

impl fmt::Debug for BackoffPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackoffPolicy")
            .field("strategy", &self.strategy)
            .field("base", &self.base)
            .field("max", &self.max)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(500), Duration::from_secs(8))
    }
}

impl BackoffPolicy {
    pub fn new(strategy: BackoffStrategy, base: Duration, max: Duration) -> Self {
        Self {
            strategy,
            base,
            max: max.max(base),
            jitter: Jitter::None,
            random: Arc::new(ThreadRandom),
        }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::new(BackoffStrategy::Exponential, base, max)
    }

    pub fn linear(base: Duration, max: Duration) -> Self {
        Self::new(BackoffStrategy::Linear, base, max)
    }

    pub fn constant(delay: Duration) -> Self {
        Self::new(BackoffStrategy::Constant, delay, delay)
    }

    /// Set the jitter. Factors are clamped into `[0, 1]`.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter.normalized();
        self
    }

    /// Replace the random source (seeded or fixed sources make delays reproducible).
    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn strategy(&self) -> BackoffStrategy {
        self.strategy
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let raw = match self.strategy {
            BackoffStrategy::Exponential => {
                self.base.saturating_mul(2u32.saturating_pow(attempt))
            }
            BackoffStrategy::Linear => self.base.saturating_mul(attempt.saturating_add(1)),
            BackoffStrategy::Constant => self.base,
        };
        raw.min(self.max)
    }

    /// Delay before retry number `attempt` (0-based), with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        let secs = capped.as_secs_f64();
        let jittered = match self.jitter {
            Jitter::None => return capped,
            Jitter::Multiplicative(j) => secs * (1.0 - j + self.random.next_unit() * 2.0 * j),
            Jitter::Additive(j) => secs + self.random.next_unit() * secs * j,
            Jitter::Bounded { lo, hi } => secs * (lo + self.random.next_unit() * (hi - lo)),
        };
        Duration::try_from_secs_f64(jittered.max(0.0))
            .unwrap_or(capped)
            .min(self.upper_bound())
    }

    /// Largest delay [`delay`](Self::delay) can ever return.
    pub fn upper_bound(&self) -> Duration {
        Duration::try_from_secs_f64(self.max.as_secs_f64() * self.jitter.upper_factor())
            .unwrap_or(Duration::MAX)
    }
}
