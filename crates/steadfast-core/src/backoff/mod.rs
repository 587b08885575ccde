//! Backoff delay computation.
//!
//! A [`BackoffPolicy`] is pure data plus an injectable random source: it
//! computes how long to wait before attempt `n` and never sleeps itself.
//! Every wait point in the crate (retry sleeps, semaphore contention, poll
//! intervals) goes through this type so delays stay bounded and testable.

mod policy;
mod random;

pub use policy::{BackoffPolicy, BackoffStrategy, Jitter};
pub use random::{FixedRandom, RandomSource, SeededRandom, ThreadRandom};
