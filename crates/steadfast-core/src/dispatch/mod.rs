//! The composed call path.
//!
//! [`Dispatcher`] owns one instance of every stateful component and runs each
//! call through them in order: pool routing, circuit admission, the shared
//! rate-limit window, the per-pool connection limit, the per-destination byte
//! budget, the exchange itself, and classification of the outcome. Retries go
//! back through every gate, so a retry can be refused by a circuit that
//! opened in the meantime.

mod call;
mod dispatcher;

pub use call::{CallSpec, DispatchSettings};
pub use dispatcher::Dispatcher;
