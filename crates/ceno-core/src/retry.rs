//! Bounded retries with exponential backoff for transient origin failures.
//!
//! Filtering is never retried: a censored response is an answer, not a
//! glitch, and retrying it only delays the fallback to the next stage.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::cancel::{until_cancelled, CancellationToken};
use crate::config::DispatchDefaults;
use crate::{CenoError, Result};

/// Backoff policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Scale each delay by a random factor in `[0.5, 1.5)`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DispatchDefaults::ORIGIN_RETRY_ATTEMPTS,
            base_delay: DispatchDefaults::ORIGIN_RETRY_BASE_DELAY,
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `retry` (0-indexed), doubling each time.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let doubled = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry.min(16)));
        let capped = doubled.min(self.max_delay);
        if !self.jitter {
            return capped;
        }
        let factor: f64 = rand::rng().random_range(0.5..1.5);
        capped.mul_f64(factor).min(self.max_delay)
    }
}

/// Outcome bookkeeping for one retried operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryStats {
    pub attempts: u32,
    pub total_delay: Duration,
    pub last_error: Option<String>,
}

/// Whether a failed origin attempt is worth repeating.
pub fn is_transient(error: &CenoError) -> bool {
    error.is_retryable() && !error.is_filtering()
}

/// Run `operation` until it succeeds, fails permanently, exhausts the
/// policy, or `cancel` fires. Backoff sleeps are cancellable.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> (Result<T>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut stats = RetryStats::default();
    let max_attempts = policy.max_attempts.max(1);

    loop {
        stats.attempts += 1;

        let error = match until_cancelled(cancel, operation()).await {
            Ok(Ok(value)) => {
                if stats.attempts > 1 {
                    debug!("Succeeded after {} attempts", stats.attempts);
                }
                return (Ok(value), stats);
            }
            Ok(Err(e)) => e,
            Err(cancelled) => return (Err(cancelled.into()), stats),
        };

        stats.last_error = Some(error.to_string());

        if !is_transient(&error) {
            debug!("Not retrying: {}", error);
            return (Err(error), stats);
        }
        if stats.attempts >= max_attempts {
            warn!("Giving up after {} attempts: {}", stats.attempts, error);
            return (Err(error), stats);
        }

        let delay = policy.delay_for(stats.attempts - 1);
        stats.total_delay += delay;
        debug!(
            "Attempt {}/{} failed: {}; retrying in {:?}",
            stats.attempts, max_attempts, error, delay
        );

        if let Err(cancelled) = until_cancelled(cancel, tokio::time::sleep(delay)).await {
            return (Err(cancelled.into()), stats);
        }
    }
}
