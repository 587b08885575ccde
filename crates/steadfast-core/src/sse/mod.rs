//! Incremental `text/event-stream` decoding.

mod decoder;

pub use decoder::{ServerSentEvent, SseDecoder};
