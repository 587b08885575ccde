//! `steadfast sse <path>` – decode a captured event stream.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::path::Path;
use steadfast_core::sse::{ServerSentEvent, SseDecoder};

/// Read size; small enough that events regularly straddle reads.
const CHUNK: usize = 4096;

pub fn run_sse(path: &Path) -> Result<()> {
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    for event in decode(&data) {
        println!("{}", event_json(&event));
    }
    Ok(())
}

fn decode(data: &[u8]) -> Vec<ServerSentEvent> {
    let mut decoder = SseDecoder::new();
    let mut events = Vec::new();
    for chunk in data.chunks(CHUNK) {
        events.extend(decoder.feed(chunk));
    }
    events.extend(decoder.finish());
    events
}

fn event_json(event: &ServerSentEvent) -> Value {
    // Inline JSON payloads stay structured; anything else is printed as text.
    let data = serde_json::from_str::<Value>(&event.data).unwrap_or_else(|_| json!(event.data));
    json!({
        "event": event.event,
        "id": event.id,
        "retry": event.retry,
        "data": data,
    })
}
