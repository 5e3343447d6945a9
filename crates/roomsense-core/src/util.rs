//! Deadline and retry helpers for hardware-facing calls.
//!
//! Every blocking radio or shell operation in this crate carries an explicit
//! deadline; none may block unboundedly. A timed-out operation is *abandoned*,
//! not cancelled: the underlying future keeps running on a detached task and
//! its side effects (a stuck "connecting" state, a wedged driver) are cleaned
//! up defensively by later steps or by an adapter reset.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// A bounded operation did not complete before its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation did not complete within the deadline")]
pub struct DeadlineExceeded;

/// Why a [`retry_with_deadline`] loop gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The overall deadline elapsed before an attempt succeeded.
    #[error("retries abandoned: overall deadline elapsed")]
    DeadlineExceeded,

    /// Every attempt failed; carries the last attempt's error.
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExceeded {
        /// Number of attempts made.
        attempts: u32,
        /// Error from the final attempt.
        #[source]
        last: E,
    },
}

/// Run `future` on its own task, bounded by `deadline`.
///
/// On timeout the task is left running detached rather than dropped, so the
/// underlying driver call is never cancelled mid-flight.
pub async fn run_with_deadline<F, T>(deadline: Duration, future: F) -> Result<T, DeadlineExceeded>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::spawn(future);
    match tokio::time::timeout(deadline, handle).await {
        Ok(Ok(value)) => Ok(value),
        // The task panicked or was aborted; either way no value will arrive.
        Ok(Err(_)) => Err(DeadlineExceeded),
        Err(_) => Err(DeadlineExceeded),
    }
}

/// Retry `op` up to `max_attempts` times within an overall `deadline`,
/// pausing `pause` between attempts. Each attempt receives the remaining
/// budget so a slow early attempt shrinks the bound for later ones.
pub async fn retry_with_deadline<T, E, F, Fut>(
    max_attempts: u32,
    deadline: Duration,
    pause: Duration,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let cutoff = Instant::now() + deadline;

    for attempt in 1..=max_attempts {
        let remaining = cutoff.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RetryError::DeadlineExceeded);
        }

        match op(remaining).await {
            Ok(value) => return Ok(value),
            Err(last) if attempt == max_attempts => {
                return Err(RetryError::RetriesExceeded {
                    attempts: max_attempts,
                    last,
                });
            }
            Err(_) => {
                if Instant::now() + pause >= cutoff {
                    return Err(RetryError::DeadlineExceeded);
                }
                tokio::time::sleep(pause).await;
            }
        }
    }

    Err(RetryError::DeadlineExceeded)
}
