use serde::de::DeserializeOwned;

use crate::error::CoreError;

/// One decoded event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSentEvent {
    pub event: Option<String>,
    /// Data lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
    /// Reconnection hint in milliseconds.
    pub retry: Option<u64>,
}

impl ServerSentEvent {
    /// Deserialize `data` as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, CoreError> {
        serde_json::from_str(&self.data)
            .map_err(|e| CoreError::InvalidResponse(format!("event data is not valid JSON: {e}")))
    }
}

/// Stateful decoder: feed chunks as they arrive, collect complete events.
///
/// Input is buffered as bytes and only complete blocks are turned into text,
/// so a UTF-8 sequence split across chunks is decoded correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back waiting for a block delimiter.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append `chunk` and return every event completed by it.
    pub fn feed(&mut self, chunk: impl AsRef<[u8]>) -> Vec<ServerSentEvent> {
        self.buffer.extend_from_slice(chunk.as_ref());
        let mut events = Vec::new();
        while let Some((at, len)) = find_delimiter(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..at + len).take(at).collect();
            if let Some(event) = parse_block(&block) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing block that was never terminated (end of stream).
    pub fn finish(&mut self) -> Option<ServerSentEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_block(&rest)
    }
}

/// Earliest blank-line delimiter as `(offset, length)`.
fn find_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    const DELIMITERS: [&[u8]; 3] = [b"\r\n\r\n", b"\n\n", b"\r\r"];
    DELIMITERS
        .iter()
        .filter_map(|d| {
            buf.windows(d.len())
                .position(|w| w == *d)
                .map(|at| (at, d.len()))
        })
        .min_by_key(|&(at, _)| at)
}

fn parse_block(block: &[u8]) -> Option<ServerSentEvent> {
    let text = String::from_utf8_lossy(block);
    let mut event = ServerSentEvent::default();
    let mut data: Vec<&str> = Vec::new();
    let mut has_data = false;

    for line in text.split(['\r', '\n']) {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => {
                has_data = true;
                data.push(value);
            }
            "event" => event.event = Some(value.to_string()),
            "id" => event.id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.trim().parse::<u64>() {
                    event.retry = Some(ms);
                }
            }
            _ => {}
        }
    }

    if !has_data {
        return None;
    }
    event.data = data.join("\n");
    Some(event)
}
