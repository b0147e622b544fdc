//! Circuit breaker: halt a job after too many consecutive fatal failures.
//!
//! Only fatal LLM errors count. Transient failures that exhausted their
//! retries and unparseable responses are reported per record, but they say
//! nothing about whether the *next* call will work, so they leave the
//! breaker alone.

use std::{
    error, fmt,
    sync::{Arc, Mutex},
};

use crate::prelude::*;

/// Shared, thread-safe failure counter. Clones share state.
#[derive(Clone, Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    inner: Arc<Mutex<BreakerInner>>,
}

#[derive(Debug, Default)]
struct BreakerInner {
    consecutive_failures: u32,
    last_error: Option<String>,
    last_failed_record: Option<JsonObject>,
}

impl CircuitBreaker {
    /// A breaker that trips after `threshold` consecutive fatal failures.
    /// A threshold of 0 disables tripping entirely.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            inner: Arc::new(Mutex::new(BreakerInner::default())),
        }
    }

    /// Record a fatal failure for `record`.
    pub fn record_failure(&self, error: &dyn fmt::Display, record: &JsonObject) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures += 1;
        inner.last_error = Some(error.to_string());
        inner.last_failed_record = Some(record.clone());
    }

    /// Record a success, resetting the consecutive-failure count.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures = 0;
        inner.last_error = None;
        inner.last_failed_record = None;
    }

    /// Manually reset, allowing a caller to continue past a trip.
    pub fn reset(&self) {
        self.record_success();
    }

    /// Has the failure count reached the threshold?
    pub fn is_tripped(&self) -> bool {
        if self.threshold == 0 {
            return false;
        }
        let inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures >= self.threshold
    }

    /// A snapshot of the breaker's state, for error reporting.
    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerStatus {
            consecutive_failures: inner.consecutive_failures,
            threshold: self.threshold,
            is_tripped: self.threshold > 0
                && inner.consecutive_failures >= self.threshold,
            last_error: inner.last_error.clone(),
            last_failed_record: inner.last_failed_record.clone(),
        }
    }
}

/// Point-in-time view of a [`CircuitBreaker`].
#[derive(Clone, Debug, Serialize)]
pub struct BreakerStatus {
    pub consecutive_failures: u32,
    pub threshold: u32,
    pub is_tripped: bool,
    pub last_error: Option<String>,
    pub last_failed_record: Option<JsonObject>,
}

/// Raised through the result stream when the breaker trips. Ends the job;
/// the caller decides whether to `reset()` and resume or abort.
#[derive(Clone, Debug)]
pub struct CircuitBreakerTripped {
    pub status: BreakerStatus,
}

impl CircuitBreakerTripped {
    pub fn new(status: BreakerStatus) -> Self {
        Self { status }
    }
}

impl fmt::Display for CircuitBreakerTripped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "circuit breaker tripped after {} consecutive failures",
            self.status.consecutive_failures
        )?;
        if let Some(last_error) = &self.status.last_error {
            write!(f, " (last error: {last_error})")?;
        }
        Ok(())
    }
}

impl error::Error for CircuitBreakerTripped {}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JsonObject {
        json!({"_idx": 3, "t": "x"}).as_object().unwrap().clone()
    }

    #[test]
    fn trips_at_threshold_and_not_before() {
        let breaker = CircuitBreaker::new(3);
        for _ in 0..2 {
            breaker.record_failure(&"boom", &record());
            assert!(!breaker.is_tripped());
        }
        breaker.record_failure(&"boom", &record());
        assert!(breaker.is_tripped());
    }

    #[test]
    fn success_resets_the_streak() {
        let breaker = CircuitBreaker::new(2);
        breaker.record_failure(&"boom", &record());
        breaker.record_success();
        breaker.record_failure(&"boom", &record());
        assert!(!breaker.is_tripped());
    }

    #[test]
    fn zero_threshold_never_trips() {
        let breaker = CircuitBreaker::new(0);
        for _ in 0..100 {
            breaker.record_failure(&"boom", &record());
        }
        assert!(!breaker.is_tripped());
    }

    #[test]
    fn status_reports_last_error_and_record() {
        let breaker = CircuitBreaker::new(5);
        breaker.record_failure(&"AuthenticationError: bad key", &record());
        let status = breaker.status();
        assert_eq!(status.consecutive_failures, 1);
        assert!(!status.is_tripped);
        assert_eq!(
            status.last_error.as_deref(),
            Some("AuthenticationError: bad key")
        );
        assert_eq!(
            status.last_failed_record.as_ref().and_then(crate::record::index_of),
            Some(3)
        );
    }

    #[test]
    fn reset_clears_a_trip() {
        let breaker = CircuitBreaker::new(1);
        breaker.record_failure(&"boom", &record());
        assert!(breaker.is_tripped());
        breaker.reset();
        assert!(!breaker.is_tripped());
        assert!(breaker.status().last_error.is_none());
    }

    #[test]
    fn clones_share_state() {
        let breaker = CircuitBreaker::new(1);
        let clone = breaker.clone();
        clone.record_failure(&"boom", &record());
        assert!(breaker.is_tripped());
    }
}
