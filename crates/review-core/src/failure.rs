//! Failure classification and retry policy.
//!
//! `ErrorClass` identifiers are wire-stable: they drive retry decisions,
//! dead-letter triage, and replay guards. Adding a class is a schema-evolution
//! event, not a refactor.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    #[serde(rename = "NETWORK_TIMEOUT")]
    NetworkTimeout,
    #[serde(rename = "UPSTREAM_5XX")]
    Upstream5xx,
    #[serde(rename = "TCP_RESET")]
    TcpReset,
    #[serde(rename = "RATE_LIMITED")]
    RateLimited,
    #[serde(rename = "UPSTREAM_INTERNAL")]
    UpstreamInternal,
    #[serde(rename = "CONFLICT")]
    Conflict,
    #[serde(rename = "SCHEMA_INVALID")]
    SchemaInvalid,
    #[serde(rename = "MISSING_FIELD")]
    MissingField,
    #[serde(rename = "INVALID_JSON")]
    InvalidJson,
    #[serde(rename = "AUTH_DENIED")]
    AuthDenied,
    #[serde(rename = "PERMISSION_DENIED")]
    PermissionDenied,
    #[serde(rename = "NOT_FOUND_PERMANENT")]
    NotFoundPermanent,
    #[serde(rename = "CONTENT_POLICY_REJECT")]
    ContentPolicyReject,
    #[serde(rename = "INVARIANT_VIOLATION")]
    InvariantViolation,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::NetworkTimeout => "NETWORK_TIMEOUT",
            ErrorClass::Upstream5xx => "UPSTREAM_5XX",
            ErrorClass::TcpReset => "TCP_RESET",
            ErrorClass::RateLimited => "RATE_LIMITED",
            ErrorClass::UpstreamInternal => "UPSTREAM_INTERNAL",
            ErrorClass::Conflict => "CONFLICT",
            ErrorClass::SchemaInvalid => "SCHEMA_INVALID",
            ErrorClass::MissingField => "MISSING_FIELD",
            ErrorClass::InvalidJson => "INVALID_JSON",
            ErrorClass::AuthDenied => "AUTH_DENIED",
            ErrorClass::PermissionDenied => "PERMISSION_DENIED",
            ErrorClass::NotFoundPermanent => "NOT_FOUND_PERMANENT",
            ErrorClass::ContentPolicyReject => "CONTENT_POLICY_REJECT",
            ErrorClass::InvariantViolation => "INVARIANT_VIOLATION",
        }
    }

    /// Whether the class is eligible for backoff-and-retry under the stage
    /// attempt budget. Non-retryable classes dead-letter immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::NetworkTimeout
                | ErrorClass::Upstream5xx
                | ErrorClass::TcpReset
                | ErrorClass::RateLimited
                | ErrorClass::UpstreamInternal
                | ErrorClass::Conflict
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NETWORK_TIMEOUT" => Ok(ErrorClass::NetworkTimeout),
            "UPSTREAM_5XX" => Ok(ErrorClass::Upstream5xx),
            "TCP_RESET" => Ok(ErrorClass::TcpReset),
            "RATE_LIMITED" => Ok(ErrorClass::RateLimited),
            "UPSTREAM_INTERNAL" => Ok(ErrorClass::UpstreamInternal),
            "CONFLICT" => Ok(ErrorClass::Conflict),
            "SCHEMA_INVALID" => Ok(ErrorClass::SchemaInvalid),
            "MISSING_FIELD" => Ok(ErrorClass::MissingField),
            "INVALID_JSON" => Ok(ErrorClass::InvalidJson),
            "AUTH_DENIED" => Ok(ErrorClass::AuthDenied),
            "PERMISSION_DENIED" => Ok(ErrorClass::PermissionDenied),
            "NOT_FOUND_PERMANENT" => Ok(ErrorClass::NotFoundPermanent),
            "CONTENT_POLICY_REJECT" => Ok(ErrorClass::ContentPolicyReject),
            "INVARIANT_VIOLATION" => Ok(ErrorClass::InvariantViolation),
            other => Err(ParseError::ErrorClass(other.to_owned())),
        }
    }
}

/// An error that already carries its failure class, raised by external
/// collaborators and internal invariant checks.
#[derive(Debug, Error)]
#[error("{class}: {message}")]
pub struct ClassifiedError {
    pub class: ErrorClass,
    pub message: String,

    /// Upstream-requested minimum delay before the next attempt.
    pub retry_after: Option<Duration>,
}

impl ClassifiedError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Deadline expiry on an external call.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::NetworkTimeout, message)
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::InvariantViolation, message)
    }
}

/// Map an error chain to its failure class.
///
/// Errors that were not raised as `ClassifiedError` anywhere in the chain
/// default to `UPSTREAM_INTERNAL` (retryable): a transient infrastructure
/// fault must not dead-letter on first occurrence. Invariant breaches are
/// raised explicitly as `INVARIANT_VIOLATION` at the point of detection.
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    for cause in err.chain() {
        if let Some(classified) = cause.downcast_ref::<ClassifiedError>() {
            return classified.class;
        }
    }
    ErrorClass::UpstreamInternal
}

/// Retry-After carried by an error chain, if any.
pub fn retry_after_of(err: &anyhow::Error) -> Option<Duration> {
    for cause in err.chain() {
        if let Some(classified) = cause.downcast_ref::<ClassifiedError>() {
            return classified.retry_after;
        }
    }
    None
}

/// Per-stage retry budgeting with full-jitter exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,

    /// Attempts per stage, inclusive of the first.
    pub max_attempts: i32,

    /// Ceiling applied when honoring an upstream `Retry-After`.
    pub retry_after_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            retry_after_cap: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the jitter window for the given attempt (1-based):
    /// `min(max_delay, initial_delay * multiplier^(attempt-1))`.
    pub fn backoff_ceiling(&self, attempt: i32) -> Duration {
        let exp = attempt.max(1) - 1;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }

    /// Full-jitter delay for the given attempt, honoring `Retry-After` as a
    /// floor capped at `retry_after_cap`. Recomputed per attempt.
    pub fn next_delay(&self, attempt: i32, retry_after: Option<Duration>) -> Duration {
        let ceiling_ms = self.backoff_ceiling(attempt).as_millis().min(u64::MAX as u128) as u64;
        let jittered = Duration::from_millis(fastrand::u64(0..=ceiling_ms));
        match retry_after {
            Some(ra) => jittered.max(ra).min(self.retry_after_cap),
            None => jittered,
        }
    }

    /// Whether the stage budget is spent after `attempt_count` attempts.
    pub fn budget_exhausted(&self, attempt_count: i32) -> bool {
        attempt_count >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_partition_matches_classification_table() {
        let retryable = [
            ErrorClass::NetworkTimeout,
            ErrorClass::Upstream5xx,
            ErrorClass::TcpReset,
            ErrorClass::RateLimited,
            ErrorClass::UpstreamInternal,
            ErrorClass::Conflict,
        ];
        let permanent = [
            ErrorClass::SchemaInvalid,
            ErrorClass::MissingField,
            ErrorClass::InvalidJson,
            ErrorClass::AuthDenied,
            ErrorClass::PermissionDenied,
            ErrorClass::NotFoundPermanent,
            ErrorClass::ContentPolicyReject,
            ErrorClass::InvariantViolation,
        ];
        for class in retryable {
            assert!(class.is_retryable(), "{class} should be retryable");
        }
        for class in permanent {
            assert!(!class.is_retryable(), "{class} should not be retryable");
        }
    }

    #[test]
    fn error_class_round_trips_through_wire_string() {
        let all = [
            ErrorClass::NetworkTimeout,
            ErrorClass::Upstream5xx,
            ErrorClass::TcpReset,
            ErrorClass::RateLimited,
            ErrorClass::UpstreamInternal,
            ErrorClass::Conflict,
            ErrorClass::SchemaInvalid,
            ErrorClass::MissingField,
            ErrorClass::InvalidJson,
            ErrorClass::AuthDenied,
            ErrorClass::PermissionDenied,
            ErrorClass::NotFoundPermanent,
            ErrorClass::ContentPolicyReject,
            ErrorClass::InvariantViolation,
        ];
        for class in all {
            assert_eq!(class.as_str().parse::<ErrorClass>().unwrap(), class);
        }
        assert!("SOMETHING_ELSE".parse::<ErrorClass>().is_err());
    }

    #[test]
    fn classify_prefers_classified_cause() {
        let err = anyhow::Error::from(ClassifiedError::new(ErrorClass::RateLimited, "429"))
            .context("call model");
        assert_eq!(classify(&err), ErrorClass::RateLimited);

        let plain = anyhow::anyhow!("socket closed unexpectedly");
        assert_eq!(classify(&plain), ErrorClass::UpstreamInternal);
    }

    #[test]
    fn backoff_ceiling_grows_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_ceiling(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_ceiling(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_ceiling(5), Duration::from_secs(16));
        assert_eq!(policy.backoff_ceiling(7), Duration::from_secs(60));
        assert_eq!(policy.backoff_ceiling(50), Duration::from_secs(60));
    }

    #[test]
    fn jittered_delay_stays_within_window_for_each_attempt() {
        let policy = RetryPolicy::default();
        for attempt in 1..=5 {
            let ceiling = policy.backoff_ceiling(attempt);
            for _ in 0..200 {
                let delay = policy.next_delay(attempt, None);
                assert!(
                    delay <= ceiling,
                    "attempt {attempt}: delay {delay:?} above ceiling {ceiling:?}"
                );
            }
        }
    }

    #[test]
    fn retry_after_floors_the_delay_and_is_capped() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.next_delay(1, Some(Duration::from_secs(30)));
            assert!(delay >= Duration::from_secs(30));
            assert!(delay <= policy.retry_after_cap);
        }
        let delay = policy.next_delay(1, Some(Duration::from_secs(3600)));
        assert_eq!(delay, policy.retry_after_cap);
    }

    #[test]
    fn budget_is_inclusive_of_first_attempt() {
        let policy = RetryPolicy::default();
        assert!(!policy.budget_exhausted(4));
        assert!(policy.budget_exhausted(5));
        assert!(policy.budget_exhausted(6));
    }
}
