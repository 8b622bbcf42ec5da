//! Retry policy: pure mapping from (attempt count, failure kind) to a
//! backoff delay or a terminal give-up.

use std::time::Duration;

use crate::task::FailureKind;

/// Exponential-backoff retry policy attached to a task.
///
/// No jitter, no hidden state: `delay(n) = min(base_delay * 2^n,
/// max_delay)`, truncated to whole seconds, so callers can reproduce the
/// schedule exactly.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of lease cycles before giving up.
    pub max_attempts: u32,

    /// Delay granted after the first failed attempt.
    pub base_delay: Duration,

    /// Ceiling applied to every delay, including the first.
    pub max_delay: Duration,

    /// Failure kinds worth retrying. Empty means any failure kind is
    /// retryable. A listed kind also covers its sub-kinds.
    pub retryable_kinds: Vec<FailureKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            retryable_kinds: Vec::new(),
        }
    }
}

/// Outcome of consulting the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reschedule after this delay.
    RetryAt(Duration),
    /// Stop retrying; the job goes to `failed`.
    GiveUp,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Restrict retries to the given kinds (and their sub-kinds).
    pub fn retry_on<K: Into<FailureKind>>(mut self, kinds: impl IntoIterator<Item = K>) -> Self {
        self.retryable_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Decide whether a job that has already made `attempts` attempts gets
    /// another one.
    ///
    /// Deterministic: identical inputs always yield identical output.
    pub fn decide(&self, attempts: u32, failure_kind: Option<&FailureKind>) -> RetryDecision {
        if attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        if !self.retryable_kinds.is_empty()
            && let Some(kind) = failure_kind
            && !self.retryable_kinds.iter().any(|allowed| kind.specializes(allowed))
        {
            return RetryDecision::GiveUp;
        }

        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * 2f64.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        // Truncate, not round: a 1.5s computed delay grants 1s.
        RetryDecision::RetryAt(Duration::from_secs(capped as u64))
    }
}
