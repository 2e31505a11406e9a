//! Per-backend circuit breaker marking hidden-service backends "known-blocked".
//!
//! - CLOSED: connect attempts go through
//! - OPEN: the backend is skipped by the multiplexer
//! - HALF_OPEN: after the recovery timeout, a limited number of trial calls go through

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::MultiplexDefaults;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive connect failures before the backend is considered blocked.
    pub failure_threshold: u32,
    /// How long a blocked backend is skipped before it is tried again.
    pub recovery_timeout: Duration,
    /// Trial calls allowed while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: MultiplexDefaults::CIRCUIT_FAILURE_THRESHOLD,
            recovery_timeout: MultiplexDefaults::CIRCUIT_RECOVERY_TIMEOUT,
            half_open_max_calls: 1,
        }
    }
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    total_failures: u64,
    total_successes: u64,
    opened_at: Option<Instant>,
    half_open_calls: u32,
}

pub struct CircuitBreaker {
    backend: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(backend: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            backend: backend.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                total_failures: 0,
                total_successes: 0,
                opened_at: None,
                half_open_calls: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Whether a connect attempt may be made on this backend now.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Return a trial slot taken by [`allow_request`](Self::allow_request)
    /// whose attempt ended with no outcome, e.g. a connect that lost a race
    /// and was cancelled. Outside HALF_OPEN this does nothing.
    pub fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.half_open_calls > 0 {
            inner.half_open_calls -= 1;
            debug!("Backend {} trial abandoned, slot returned", self.backend);
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            info!("Backend {} recovered, circuit CLOSED", self.backend);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        inner.consecutive_failures += 1;

        let should_open = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if should_open {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.half_open_calls = 0;
            warn!(
                "Backend {} marked blocked after {} consecutive failures",
                self.backend, inner.consecutive_failures
            );
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        CircuitBreakerStats {
            backend: self.backend.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.half_open_calls = 0;
        debug!("Circuit for backend {} reset", self.backend);
    }

    fn maybe_half_open(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        if let Some(opened) = inner.opened_at {
            if opened.elapsed() >= self.config.recovery_timeout {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_calls = 0;
                debug!("Backend {} circuit HALF_OPEN, probing", self.backend);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerStats {
    pub backend: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "i2p",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
                half_open_max_calls: 1,
            },
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker(2, Duration::from_secs(60));
        assert!(cb.allow_request());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_success_clears_consecutive_failures() {
        let cb = breaker(2, Duration::from_secs(60));
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().total_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_then_close() {
        let cb = breaker(1, Duration::from_millis(100));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow_request());
        assert!(!cb.allow_request());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(1, Duration::from_millis(100));
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(cb.allow_request());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_frees_its_slot() {
        let cb = breaker(1, Duration::from_millis(100));
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(150)).await;

        assert!(cb.allow_request());
        assert!(!cb.allow_request());
        cb.release_trial();

        // Denied calls must not eat into the slot either.
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_release_trial_ignored_when_closed() {
        let cb = breaker(2, Duration::from_secs(60));
        cb.release_trial();
        assert!(cb.allow_request());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_reset() {
        let cb = breaker(1, Duration::from_secs(60));
        cb.record_failure();
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
