//! Bounded retry and transient error classification for Folio backends
//!
//! Storage adapters and the workspace crawler both talk to remote services
//! that occasionally drop a connection or time out. This crate gives them one
//! shared policy: classify the error, and retry a transient failure a bounded
//! number of times (one, by default) before surfacing it. Permanent failures
//! such as permission or validation errors are never retried.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::Future;
use std::fmt::Display;
use std::time::Duration;
use tracing::{debug, warn};

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

impl RetryableError for std::io::Error {
    fn is_transient(&self) -> bool {
        use std::io::ErrorKind;
        matches!(
            self.kind(),
            ErrorKind::TimedOut
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::BrokenPipe
                | ErrorKind::Interrupted
        )
    }
}

/// How many times a transient failure is retried and how long to wait between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: usize,
    initial_interval: Duration,
    max_interval: Duration,
    multiplier: f64,
}

impl RetryPolicy {
    /// A single retry after a short delay. This is the default for every backend call.
    pub fn single() -> Self {
        Self {
            max_retries: 1,
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }

    /// No retries at all; the first failure is returned as-is.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::single()
        }
    }

    /// Override the number of retries allowed after the first attempt
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Override the delay before the first retry
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Build a fresh delay schedule for one operation.
    fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(0.1)
            .with_max_elapsed_time(None)
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::single()
    }
}

/// Run `f`, retrying only transient failures while the policy allows it.
///
/// `f` receives the 1-based attempt number. The last error is returned
/// unchanged once retries are exhausted or a permanent error is seen.
pub async fn retry_transient<F, Fut, T, E>(op_name: &str, policy: &RetryPolicy, mut f: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + Display,
{
    let mut schedule = policy.schedule();
    let mut attempt = 1;

    loop {
        match f(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = op_name, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt <= policy.max_retries => {
                let delay = schedule.next_backoff().unwrap_or(policy.initial_interval);
                warn!(
                    operation = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_transient() {
                    warn!(operation = op_name, attempt, error = %err, "retries exhausted");
                }
                return Err(err);
            }
        }
    }
}
