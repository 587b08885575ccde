//! Telemetry hook.
//!
//! The core only decides *when* to emit and which fields describe the
//! situation; what happens to an event is up to the [`TelemetrySink`].
//! [`TracingSink`] forwards events to `tracing`.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub name: String,
    pub severity: Severity,
    pub fields: Map<String, Value>,
}

impl TelemetryEvent {
    pub fn new(name: impl Into<String>, severity: Severity) -> Self {
        Self {
            name: name.into(),
            severity,
            fields: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Event describing a failed operation.
    pub fn failure(operation: &str, error: &CoreError, elapsed: Duration) -> Self {
        let severity = match error {
            CoreError::Cancelled => Severity::Info,
            e if e.is_retryable() => Severity::Warning,
            _ => Severity::Error,
        };
        let mut event = Self::new("operation_failed", severity)
            .with("operation", operation)
            .with("kind", error.kind_name())
            .with("message", error.to_string())
            .with("elapsed_ms", elapsed.as_millis() as u64);
        if let Some(status) = error.status() {
            event = event.with("status", status);
        }
        match error {
            CoreError::ProgressTimeout {
                last_state,
                last_reason,
                ..
            }
            | CoreError::QueueBusy {
                queue_state: last_state,
                reason: last_reason,
            } => {
                if let Some(state) = last_state {
                    event = event.with("queue_state", state.as_str());
                }
                if let Some(reason) = last_reason {
                    event = event.with("queue_state_reason", reason.as_str());
                }
            }
            _ => {}
        }
        event
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Receives telemetry events. Must not block.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: TelemetryEvent) {
        let fields = Value::Object(event.fields);
        match event.severity {
            Severity::Info => info!(event = %event.name, %fields, "telemetry"),
            Severity::Warning | Severity::Error => {
                warn!(event = %event.name, severity = ?event.severity, %fields, "telemetry")
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn named(&self, name: &str) -> Vec<TelemetryEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.name == name)
            .collect()
    }
}

impl TelemetrySink for RecordingSink {
    fn emit(&self, event: TelemetryEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Await `operation`, emitting an `operation_failed` event if it fails. The
/// result is returned unchanged.
pub async fn capture<T, Fut>(
    sink: &dyn TelemetrySink,
    operation: &str,
    fut: Fut,
) -> Result<T, CoreError>
where
    Fut: Future<Output = Result<T, CoreError>>,
{
    let started = Instant::now();
    let result = fut.await;
    if let Err(e) = &result {
        sink.emit(TelemetryEvent::failure(operation, e, started.elapsed()));
    }
    result
}
