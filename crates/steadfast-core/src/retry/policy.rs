use std::time::Duration;

use crate::backoff::BackoffPolicy;

use super::state::RetryState;

/// Caller-supplied classification of one attempt's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Done; return the result.
    Success,
    /// Done; retrying cannot help.
    Fatal,
    /// Try again after the policy's backoff.
    Retry,
    /// Try again after the given server-supplied delay.
    RetryAfter(Duration),
}

/// Why the retry loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Succeeded,
    Fatal,
    AttemptsExhausted,
    ElapsedExceeded,
    ProgressStalled,
}

/// Decision returned by [`RetrySettings::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the last result.
    Stop(StopReason),
    /// Retry after the given delay.
    RetryAfter(Duration),
}

/// Retry bounds plus the backoff shape used between attempts.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Retries allowed after the first attempt (0 = try once).
    pub max_retries: u32,
    /// Give up once this much time has passed since the first attempt.
    pub max_elapsed: Option<Duration>,
    /// Give up once no progress has been marked for this long.
    pub progress_timeout: Option<Duration>,
    pub backoff: BackoffPolicy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_elapsed: None,
            progress_timeout: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetrySettings {
    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_max_elapsed(mut self, d: Duration) -> Self {
        self.max_elapsed = Some(d);
        self
    }

    pub fn with_progress_timeout(mut self, d: Duration) -> Self {
        self.progress_timeout = Some(d);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Decide what to do after an attempt classified as `verdict`.
    pub fn decide(&self, state: &RetryState, verdict: Verdict) -> RetryDecision {
        let hint = match verdict {
            Verdict::Success => return RetryDecision::Stop(StopReason::Succeeded),
            Verdict::Fatal => return RetryDecision::Stop(StopReason::Fatal),
            Verdict::Retry => None,
            Verdict::RetryAfter(d) => Some(d),
        };

        if state.attempt >= self.max_retries {
            return RetryDecision::Stop(StopReason::AttemptsExhausted);
        }
        if let Some(max) = self.max_elapsed {
            if state.elapsed() > max {
                return RetryDecision::Stop(StopReason::ElapsedExceeded);
            }
        }
        if let Some(timeout) = self.progress_timeout {
            if state.progress.since_last() > timeout {
                return RetryDecision::Stop(StopReason::ProgressStalled);
            }
        }

        RetryDecision::RetryAfter(hint.unwrap_or_else(|| self.backoff.delay(state.attempt)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RetrySettings {
        RetrySettings::default()
            .with_max_retries(3)
            .with_backoff(BackoffPolicy::exponential(
                Duration::from_millis(100),
                Duration::from_secs(1),
            ))
    }

    #[test]
    fn terminal_verdicts_stop() {
        let s = settings();
        let state = RetryState::new();
        assert_eq!(
            s.decide(&state, Verdict::Success),
            RetryDecision::Stop(StopReason::Succeeded)
        );
        assert_eq!(
            s.decide(&state, Verdict::Fatal),
            RetryDecision::Stop(StopReason::Fatal)
        );
    }

    #[test]
    fn backoff_grows_with_attempt() {
        let s = settings();
        let mut state = RetryState::new();
        assert_eq!(
            s.decide(&state, Verdict::Retry),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
        state.attempt = 2;
        assert_eq!(
            s.decide(&state, Verdict::Retry),
            RetryDecision::RetryAfter(Duration::from_millis(400))
        );
    }

    #[test]
    fn respects_max_retries() {
        let s = settings();
        let mut state = RetryState::new();
        state.attempt = 3;
        assert_eq!(
            s.decide(&state, Verdict::Retry),
            RetryDecision::Stop(StopReason::AttemptsExhausted)
        );
    }

    #[test]
    fn server_hint_overrides_backoff() {
        let s = settings();
        let state = RetryState::new();
        assert_eq!(
            s.decide(&state, Verdict::RetryAfter(Duration::from_secs(7))),
            RetryDecision::RetryAfter(Duration::from_secs(7))
        );
    }

    #[test]
    fn stalled_progress_stops_even_with_attempts_left() {
        let s = settings().with_progress_timeout(Duration::from_millis(10));
        let state = RetryState::new();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(
            s.decide(&state, Verdict::Retry),
            RetryDecision::Stop(StopReason::ProgressStalled)
        );
        state.progress.mark();
        assert!(matches!(
            s.decide(&state, Verdict::Retry),
            RetryDecision::RetryAfter(_)
        ));
    }

    #[test]
    fn elapsed_budget_stops() {
        let s = settings().with_max_elapsed(Duration::from_millis(5));
        let state = RetryState::new();
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(
            s.decide(&state, Verdict::Retry),
            RetryDecision::Stop(StopReason::ElapsedExceeded)
        );
    }
}
