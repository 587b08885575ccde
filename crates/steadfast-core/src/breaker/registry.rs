//! Keyed registry of circuit records.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use tracing::{info, warn};

use crate::error::CoreError;

use super::record::{Admission, BreakerConfig, CircuitRecord, CircuitState};

/// Shared registry of destination key -> circuit record.
///
/// The outer map lock is held only to find or insert a record; every
/// transition happens under that record's own mutex, which is never held
/// across an await.
#[derive(Debug, Default)]
pub struct CircuitRegistry {
    config: BreakerConfig,
    records: RwLock<HashMap<String, Arc<Mutex<CircuitRecord>>>>,
}

impl CircuitRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn record(&self, key: &str) -> Arc<Mutex<CircuitRecord>> {
        if let Some(rec) = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Arc::clone(rec);
        }
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(records.entry(key.to_string()).or_default())
    }

    /// Ask to send a call to `key`. Fails fast with `CircuitOpen` while the
    /// circuit is open or a half-open probe is already in flight.
    pub fn admit(&self, key: &str) -> Result<CircuitPermit, CoreError> {
        let record = self.record(key);
        let admission = {
            let mut rec = record.lock().unwrap_or_else(PoisonError::into_inner);
            rec.admit(Instant::now(), &self.config)
        };
        match admission {
            Ok(admission) => {
                if admission == Admission::Probe {
                    info!(key, "circuit half-open, sending probe");
                }
                Ok(CircuitPermit {
                    record,
                    key: key.to_string(),
                    config: self.config,
                    admission,
                    settled: false,
                })
            }
            Err(retry_in) => Err(CoreError::CircuitOpen {
                key: key.to_string(),
                retry_in,
            }),
        }
    }

    /// Run `operation` through the circuit for `key`.
    ///
    /// `operation` is not invoked when the circuit rejects the call. An error
    /// for which `trips` returns true counts as a failure; any other error and
    /// every success count as a success.
    pub async fn call<T, F, Fut, P>(
        &self,
        key: &str,
        operation: F,
        trips: P,
    ) -> Result<T, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
        P: Fn(&CoreError) -> bool,
    {
        let permit = self.admit(key)?;
        let result = operation().await;
        match &result {
            Err(e) if trips(e) => permit.failure(),
            _ => permit.success(),
        }
        result
    }

    /// Observed state for `key` (`Closed` for keys never seen).
    pub fn state(&self, key: &str) -> CircuitState {
        self.snapshot(key)
            .map(|rec| rec.effective_state(Instant::now(), &self.config))
            .unwrap_or(CircuitState::Closed)
    }

    /// Copy of the record for `key`, if one exists.
    pub fn snapshot(&self, key: &str) -> Option<CircuitRecord> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records
            .get(key)
            .map(|rec| rec.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// Return `key` to a fresh closed circuit. The record is reset in place,
    /// so permits handed out before the reset still report into it.
    pub fn reset(&self, key: &str) {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(rec) = records.get(key) {
            *rec.lock().unwrap_or_else(PoisonError::into_inner) = CircuitRecord::default();
        }
    }
}

/// Permission to send one call. Report the result with
/// [`success`](Self::success) or [`failure`](Self::failure); dropping an
/// unreported probe frees the half-open slot without changing state.
#[derive(Debug)]
pub struct CircuitPermit {
    record: Arc<Mutex<CircuitRecord>>,
    key: String,
    config: BreakerConfig,
    admission: Admission,
    settled: bool,
}

impl CircuitPermit {
    pub fn is_probe(&self) -> bool {
        self.admission == Admission::Probe
    }

    pub fn success(mut self) {
        self.settled = true;
        let closed = self
            .record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_success(self.admission);
        if closed {
            info!(key = %self.key, "circuit closed");
        }
    }

    pub fn failure(mut self) {
        self.settled = true;
        let (opened, failures) = {
            let mut rec = self.record.lock().unwrap_or_else(PoisonError::into_inner);
            let opened = rec.on_failure(self.admission, Instant::now(), &self.config);
            (opened, rec.consecutive_failures)
        };
        if opened {
            warn!(
                key = %self.key,
                failures,
                reset_timeout = ?self.config.reset_timeout,
                "circuit opened"
            );
        }
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Probe {
            self.record
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .abandon_probe();
        }
    }
}
