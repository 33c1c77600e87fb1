//! Bounded retry with exponential backoff.
//!
//! Attempt `k` (1-based) that fails is followed by a sleep of
//! `initial_delay * backoff^(k-1)`; there is no sleep after the final
//! attempt. Fatal errors end the loop immediately, and a cancellation token
//! interrupts the sleep.

use std::future::Future;
use std::time::Duration;

use stepflow_types::flow::RetryPolicy;
use tokio_util::sync::CancellationToken;

use super::error::EngineError;

// ---------------------------------------------------------------------------
// RetryExecutor
// ---------------------------------------------------------------------------

/// Stateless retry driver; all configuration arrives as parameters.
pub struct RetryExecutor;

impl RetryExecutor {
    /// Whether a failed `attempt` (1-based) should be followed by another.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, error: &EngineError) -> bool {
        error.is_recoverable() && attempt < policy.max_attempts.max(1)
    }

    /// Run `action` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `action` receives the 1-based attempt number. `on_retry` is called with
    /// the upcoming attempt number, the delay about to be slept and the error
    /// that triggered it. With `cancel` set, cancellation during a backoff
    /// sleep returns [`EngineError::Cancelled`].
    pub async fn run<T, F, Fut, R>(
        policy: &RetryPolicy,
        cancel: Option<&CancellationToken>,
        mut on_retry: R,
        mut action: F,
    ) -> Result<T, EngineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
        R: FnMut(u32, Duration, &EngineError),
    {
        let mut attempt = 1;
        loop {
            let err = match action(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !Self::should_retry(policy, attempt, &err) {
                return Err(err);
            }

            let delay = policy.delay_for_attempt(attempt - 1);
            on_retry(attempt + 1, delay, &err);

            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
            attempt += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
