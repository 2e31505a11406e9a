//! First-success-or-all-failed coordination over concurrent attempts.
//!
//! [`SuccessCondition`] is the bare primitive: participants take a
//! [`SuccessLock`], and a single waiter is released as soon as one lock is
//! released with `success = true`, or once every lock has been released
//! without success. Dropping a lock counts as a failed release, so a
//! participant that errors out, panics or is cancelled can never wedge the
//! waiter.
//!
//! [`race`] builds on the primitive: it spawns one task per [`Attempt`],
//! returns the first successful value, cancels the rest and gives them a
//! bounded grace period to unwind.
//!
//! ```rust,ignore
//! let condition = SuccessCondition::new();
//! let lock = condition.lock();
//! tokio::spawn(async move {
//!     if do_something().await {
//!         lock.release(true);
//!     }
//!     // dropping `lock` here reports failure
//! });
//! let succeeded = condition.wait_for_success().await;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cancel::{until_cancelled, CancellationToken};
use crate::error::{CenoError, Result, SourceFailure};

struct WaitState {
    counters: Mutex<Counters>,
    notify: Notify,
}

#[derive(Default)]
struct Counters {
    remaining_locks: usize,
    success: bool,
}

impl Counters {
    fn blocked(&self) -> bool {
        self.remaining_locks > 0 && !self.success
    }
}

/// Waits for one of a set of participants to succeed, or all of them to fail.
///
/// One instance coordinates exactly one race: [`wait_for_success`] consumes it.
///
/// [`wait_for_success`]: SuccessCondition::wait_for_success
pub struct SuccessCondition {
    state: Arc<WaitState>,
}

impl SuccessCondition {
    pub fn new() -> Self {
        Self {
            state: Arc::new(WaitState {
                counters: Mutex::new(Counters::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Register one participant.
    pub fn lock(&self) -> SuccessLock {
        self.state.counters.lock().remaining_locks += 1;
        SuccessLock {
            state: Some(Arc::clone(&self.state)),
        }
    }

    /// Number of participants that have not released yet.
    pub fn pending(&self) -> usize {
        self.state.counters.lock().remaining_locks
    }

    /// Wait until a participant succeeds (`true`) or all have failed (`false`).
    ///
    /// Returns immediately when the outcome is already decided, including the
    /// case of zero participants.
    pub async fn wait_for_success(self) -> bool {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and the
            // await is not lost.
            notified.as_mut().enable();

            {
                let counters = self.state.counters.lock();
                if !counters.blocked() {
                    return counters.success;
                }
            }

            notified.await;
        }
    }
}

impl Default for SuccessCondition {
    fn default() -> Self {
        Self::new()
    }
}

/// A participant's handle on a [`SuccessCondition`].
///
/// Released exactly once: explicitly through [`release`](SuccessLock::release)
/// or implicitly, as a failure, on drop.
#[must_use = "dropping a SuccessLock immediately reports failure"]
pub struct SuccessLock {
    state: Option<Arc<WaitState>>,
}

impl SuccessLock {
    pub fn release(mut self, success: bool) {
        self.release_inner(success);
    }

    fn release_inner(&mut self, success: bool) {
        let Some(state) = self.state.take() else {
            return;
        };

        let unblocked = {
            let mut counters = state.counters.lock();
            counters.remaining_locks -= 1;
            if success {
                counters.success = true;
            }
            !counters.blocked()
        };

        if unblocked {
            state.notify.notify_waiters();
        }
    }
}

impl Drop for SuccessLock {
    fn drop(&mut self) {
        self.release_inner(false);
    }
}

/// One contender in a [`race`].
pub struct Attempt<T> {
    source: String,
    future: BoxFuture<'static, Result<T>>,
}

impl<T> Attempt<T> {
    pub fn new<F>(source: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            source: source.into(),
            future: Box::pin(future),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Outcome of a [`race`].
#[derive(Debug)]
pub enum RaceResult<T> {
    Success {
        value: T,
        /// Source of the winning attempt.
        source: String,
        /// Attempts that were still in flight and got cancelled.
        cancelled: Vec<String>,
        /// Attempts that had already failed before the win.
        failures: Vec<SourceFailure>,
    },
    AllFailed(Vec<SourceFailure>),
}

impl<T> RaceResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, RaceResult::Success { .. })
    }

    /// Convert into a `Result`, building the error from the per-source failures.
    pub fn into_result(
        self,
        on_failure: impl FnOnce(Vec<SourceFailure>) -> CenoError,
    ) -> Result<(T, String)> {
        match self {
            RaceResult::Success { value, source, .. } => Ok((value, source)),
            RaceResult::AllFailed(failures) => Err(on_failure(failures)),
        }
    }
}

struct Outcome<T> {
    winner: Option<(String, T)>,
    failures: Vec<SourceFailure>,
    cancelled: Vec<String>,
}

impl<T> Default for Outcome<T> {
    fn default() -> Self {
        Self {
            winner: None,
            failures: Vec::new(),
            cancelled: Vec::new(),
        }
    }
}

/// Run `attempts` concurrently and return the first success.
///
/// Losers are cancelled through a child of `cancel` and given `grace` to
/// unwind; anything still running after that is aborted. Cancelling `cancel`
/// itself fails every pending attempt, so the race resolves promptly.
pub async fn race<T>(
    attempts: Vec<Attempt<T>>,
    cancel: &CancellationToken,
    grace: Duration,
) -> RaceResult<T>
where
    T: Send + 'static,
{
    let condition = SuccessCondition::new();
    let losers = cancel.child_token();
    let shared = Arc::new(Mutex::new(Outcome::<T>::default()));
    let mut tasks = JoinSet::new();

    for Attempt { source, future } in attempts {
        let lock = condition.lock();
        let token = losers.clone();
        let shared = Arc::clone(&shared);

        tasks.spawn(async move {
            match until_cancelled(&token, future).await {
                Ok(Ok(value)) => {
                    let mut outcome = shared.lock();
                    if outcome.winner.is_none() {
                        debug!("Race won by {}", source);
                        outcome.winner = Some((source, value));
                        drop(outcome);
                        lock.release(true);
                    } else {
                        debug!("Discarding late success from {}", source);
                    }
                }
                Ok(Err(e)) => {
                    debug!("Race attempt {} failed: {}", source, e);
                    shared.lock().failures.push(SourceFailure::new(source, e.to_string()));
                }
                Err(_) => {
                    shared.lock().cancelled.push(source);
                }
            }
        });
    }

    condition.wait_for_success().await;
    losers.cancel();

    let quiesced = tokio::time::timeout(grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if quiesced.is_err() {
        warn!(
            "{} race attempts did not unwind within {:?}, aborting",
            tasks.len(),
            grace
        );
        tasks.abort_all();
    }

    let outcome = std::mem::take(&mut *shared.lock());
    match outcome.winner {
        Some((source, value)) => RaceResult::Success {
            value,
            source,
            cancelled: outcome.cancelled,
            failures: outcome.failures,
        },
        None => {
            let mut failures = outcome.failures;
            failures.extend(
                outcome
                    .cancelled
                    .into_iter()
                    .map(|source| SourceFailure::new(source, "cancelled")),
            );
            RaceResult::AllFailed(failures)
        }
    }
}
