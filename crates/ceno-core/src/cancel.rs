//! Cooperative cancellation for async operations.
//!
//! A single [`CancellationToken`] is passed down the call chain. Child tokens
//! are cancelled together with their parent but can also be cancelled on
//! their own, which is how a race cancels its losers without touching the
//! caller's token.

use std::future::Future;

pub use tokio_util::sync::CancellationToken;

/// Error returned when an operation is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelledError;

impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation was cancelled")
    }
}

impl std::error::Error for CancelledError {}

impl From<CancelledError> for crate::error::CenoError {
    fn from(_: CancelledError) -> Self {
        crate::error::CenoError::Cancelled
    }
}

/// Check cancellation and return an error if cancelled.
pub fn check(token: &CancellationToken) -> Result<(), CancelledError> {
    if token.is_cancelled() {
        Err(CancelledError)
    } else {
        Ok(())
    }
}

/// Drive `future` until it completes or `token` is cancelled.
///
/// On cancellation the future is dropped at its current suspension point.
pub async fn until_cancelled<F>(token: &CancellationToken, future: F) -> Result<F::Output, CancelledError>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(CancelledError),
        output = future => Ok(output),
    }
}
