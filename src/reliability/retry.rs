//! Retry policy: declarative backoff policy plus an optional imperative handler

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::failure::FailureDetails;

/// Declarative retry configuration for a scheduled activity or sub-orchestration
///
/// Applies exponential backoff, capped at `max_interval`, until `max_attempts`
/// is reached or `overall_timeout` has elapsed since the first attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first (must be >= 1)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub first_interval: Duration,

    /// Multiplier applied to the interval after each retry
    pub backoff_coefficient: f64,

    /// Upper bound on the computed interval
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Upper bound on total elapsed time across all attempts; `None` means
    /// unbounded
    #[serde(with = "option_duration_millis", default)]
    pub overall_timeout: Option<Duration>,

    /// Error types that should never be retried, regardless of attempts
    /// remaining
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,

    /// An imperative override for the retry decision, superseding the
    /// declarative fields above when present
    ///
    /// Not serializable: a deserialized `RetryPolicy` never carries a
    /// handler, only the declarative fields.
    #[serde(skip)]
    pub handle: Option<RetryHandler>,
}

/// `async fn({attempt, last_failure, elapsed, cancellation}) -> bool`
///
/// Returning `true` means "retry"; `false` means "stop."
pub type RetryHandler = Arc<
    dyn Fn(RetryHandlerArgs<'_>) -> futures::future::BoxFuture<'static, bool> + Send + Sync,
>;

/// Arguments passed to a [`RetryHandler`]
pub struct RetryHandlerArgs<'a> {
    pub attempt: u32,
    pub last_failure: &'a FailureDetails,
    pub elapsed: Duration,
    pub cancellation: &'a crate::cancellation::CancellationToken,
}

impl fmt::Debug for RetryHandlerArgs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryHandlerArgs")
            .field("attempt", &self.attempt)
            .field("elapsed", &self.elapsed)
            .finish()
    }
}

impl PartialEq for RetryPolicy {
    /// Compares only the declarative fields; an attached `handle` never
    /// participates in equality (it has no meaningful comparison).
    fn eq(&self, other: &Self) -> bool {
        self.max_attempts == other.max_attempts
            && self.first_interval == other.first_interval
            && self.backoff_coefficient == other.backoff_coefficient
            && self.max_interval == other.max_interval
            && self.overall_timeout == other.overall_timeout
            && self.non_retryable_errors == other.non_retryable_errors
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// A 5-attempt exponential backoff policy with a 1s initial interval, a
    /// 2x coefficient, and a 1 hour cap — the same defaults the teacher ships.
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            first_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(3600),
            overall_timeout: None,
            non_retryable_errors: Vec::new(),
            handle: None,
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            first_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            max_interval: Duration::ZERO,
            overall_timeout: None,
            non_retryable_errors: Vec::new(),
            handle: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be >= 1");
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_first_interval(mut self, interval: Duration) -> Self {
        self.first_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        assert!(coefficient >= 1.0, "backoff_coefficient must be >= 1.0");
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = Some(timeout);
        self
    }

    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Replace the declarative policy with an imperative handler
    pub fn with_handler(mut self, handler: RetryHandler) -> Self {
        self.handle = Some(handler);
        self
    }

    /// `delay = min(first_interval * backoff_coefficient^(attempts - 1), max_interval)`
    ///
    /// `attempts` is 1-based and counts completed (failed) attempts so far.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1) as i32;
        let base = self.first_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn declarative_allows_retry(
        &self,
        failure: &FailureDetails,
        attempts: u32,
        elapsed: Duration,
    ) -> bool {
        if self
            .non_retryable_errors
            .iter()
            .any(|t| t == &failure.error_type)
        {
            return false;
        }
        if attempts >= self.max_attempts {
            return false;
        }
        if let Some(timeout) = self.overall_timeout {
            if elapsed >= timeout {
                return false;
            }
        }
        true
    }

    /// Declarative-only decision: should attempt number `attempts` (the one
    /// that just failed) be retried, given `elapsed` time since the first
    /// attempt? Ignores any imperative `handle` — callers driving a handler
    /// use [`RetryHandlerArgs`] directly instead.
    pub fn should_retry(&self, failure: &FailureDetails, attempts: u32, elapsed: Duration) -> bool {
        self.declarative_allows_retry(failure, attempts, elapsed)
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_millis().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        d.map(|d| d.as_millis()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let millis: Option<u64> = Option::deserialize(d)?;
        Ok(millis.map(Duration::from_millis))
    }
}
