//! Retry loop: run an operation until the policy says stop.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CoreError;

use super::policy::{RetryDecision, RetrySettings, StopReason, Verdict};
use super::state::{AttemptContext, RetryState};

/// Final result of a retry loop.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Result of the last attempt.
    pub result: T,
    pub state: RetryState,
    pub stop: StopReason,
}

/// Runs operations under [`RetrySettings`].
#[derive(Debug, Clone, Default)]
pub struct RetryHandler {
    settings: RetrySettings,
}

impl RetryHandler {
    pub fn new(settings: RetrySettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.settings
    }

    /// Runs `operation` until `classify` calls its result terminal or the
    /// settings say stop, sleeping the backoff delay between attempts.
    ///
    /// Attempts are strictly sequential. Returns `Err(CoreError::Cancelled)`
    /// if `cancel` fires during an attempt or a sleep; otherwise the last
    /// result is returned together with the reason the loop stopped.
    pub async fn run<T, F, Fut, C>(
        &self,
        mut operation: F,
        classify: C,
        cancel: &CancellationToken,
    ) -> Result<RetryOutcome<T>, CoreError>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = T>,
        C: Fn(&T) -> Verdict,
    {
        let mut state = RetryState::new();
        loop {
            let ctx = AttemptContext {
                attempt: state.attempt,
                progress: state.progress.clone(),
            };
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                r = operation(ctx) => r,
            };

            match self.settings.decide(&state, classify(&result)) {
                RetryDecision::Stop(stop) => {
                    if !matches!(stop, StopReason::Succeeded | StopReason::Fatal) {
                        debug!(attempt = state.attempt, ?stop, "giving up");
                    }
                    return Ok(RetryOutcome {
                        result,
                        state,
                        stop,
                    });
                }
                RetryDecision::RetryAfter(delay) => {
                    debug!(attempt = state.attempt, ?delay, "retrying after backoff");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    state.attempt = state.attempt.saturating_add(1);
                }
            }
        }
    }
}
