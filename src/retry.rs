//! Bounded retry with exponential backoff and jitter.
//!
//! Cluster calls fail transiently (timeouts, connection resets, 5xx) and
//! are worth retrying; rejections (schema validation, permission denial,
//! conflicts) are not. The policy object is injected into the
//! orchestrator so the behavior is testable in isolation: mock a client
//! to fail N times then succeed and assert the call count.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Errors that can report whether retrying may succeed
pub trait TransientError {
    /// True if the failure class is transient (retry with backoff)
    fn is_transient(&self) -> bool;
}

/// Bounded exponential backoff policy.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on the backoff delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy with a custom attempt budget and default backoff shape
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Execute an async operation, retrying transient failures with jittered
/// exponential backoff. Terminal errors return immediately; exhausting
/// the attempt budget returns the last error.
///
/// Backoff sleeps are cancellable: cancelling the token while a retry is
/// pending returns the last error without issuing further attempts. An
/// in-flight operation is never interrupted mid-call.
pub async fn retry_transient<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + TransientError,
{
    let mut attempt = 0u32;
    let mut delay = policy.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => {
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Terminal error, not retrying"
                );
                return Err(e);
            }
            Err(e) => {
                if attempt >= policy.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }
                if cancel.is_cancelled() {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Run cancelled, abandoning retries"
                    );
                    return Err(e);
                }

                // Jitter: 0.5x to 1.5x of the delay to avoid thundering herd
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered.as_millis(),
                    "Transient failure, retrying"
                );

                tokio::select! {
                    _ = tokio::time::sleep(jittered) => {}
                    _ = cancel.cancelled() => return Err(e),
                }

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * policy.multiplier).min(policy.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
