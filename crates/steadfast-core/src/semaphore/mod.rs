//! Concurrency and byte-budget gates.
//!
//! [`CountingSemaphore`] bounds in-flight dispatches per key (one key per
//! pool, i.e. per traffic class and destination). [`WeightedSemaphore`]
//! bounds the estimated in-flight payload bytes per key regardless of how
//! many requests carry them.
//!
//! Both hand out permits that release on drop, so every exit path of a
//! dispatch (success, error, cancellation, panic) gives the capacity back.

mod counting;
mod weighted;

pub use counting::{CountingPermit, CountingSemaphore};
pub use weighted::{WeightedPermit, WeightedSemaphore};

use tokio::time::Instant;

/// Resolves when `deadline` passes; never resolves without one.
async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
