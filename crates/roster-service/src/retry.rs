//! Bounded exponential backoff for transient failures.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use roster_audit::AuditStoreError;
use roster_core::StoreError;
use roster_queue::QueueError;
use serde::{Deserialize, Serialize};

use crate::config::millis;

/// Errors that know whether a retry can help.
pub trait Retryable {
    /// Returns true if the failed operation may succeed when repeated.
    fn is_retryable(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        Self::is_retryable(self)
    }
}

impl Retryable for AuditStoreError {
    fn is_retryable(&self) -> bool {
        Self::is_retryable(self)
    }
}

impl Retryable for QueueError {
    fn is_retryable(&self) -> bool {
        Self::is_retryable(self)
    }
}

/// Retry budget with capped exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    #[serde(rename = "initialBackoffMs", with = "millis")]
    pub initial_backoff: Duration,

    /// Growth factor between consecutive delays.
    pub multiplier: u32,

    /// Upper bound on any single delay.
    #[serde(rename = "maxBackoffMs", with = "millis")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2,
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// The last error seen once a retry budget ran out or a permanent error hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure<E> {
    /// The final error.
    pub error: E,

    /// Attempts made, counting from the first overall attempt.
    pub attempts: u32,
}

impl<E: Retryable> RetryFailure<E> {
    /// Returns true if the budget ran out on a retryable error.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.error.is_retryable()
    }
}

impl RetryPolicy {
    /// Creates a policy builder.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// Delay to wait after `failed_attempts` consecutive failures.
    #[must_use]
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `operation` until it succeeds, fails permanently or the budget runs out.
    ///
    /// # Errors
    ///
    /// Returns the last error together with the number of attempts made.
    pub async fn run<T, E, F, Fut>(&self, label: &str, operation: F) -> Result<T, RetryFailure<E>>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_from(1, label, operation).await
    }

    /// Like [`run`](Self::run), but continues a budget of which
    /// `first_attempt - 1` attempts were already spent elsewhere.
    ///
    /// Sleeps the backoff owed for the spent attempts before the first call.
    ///
    /// # Errors
    ///
    /// Returns the last error together with the number of attempts made.
    pub async fn run_from<T, E, F, Fut>(
        &self,
        first_attempt: u32,
        label: &str,
        mut operation: F,
    ) -> Result<T, RetryFailure<E>>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let first_attempt = first_attempt.max(1);
        let max_attempts = self.max_attempts.max(first_attempt);
        let mut attempt = first_attempt;

        loop {
            if attempt > 1 {
                tokio::time::sleep(self.backoff(attempt - 1)).await;
            }

            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !error.is_retryable() || attempt >= max_attempts {
                        return Err(RetryFailure {
                            error,
                            attempts: attempt,
                        });
                    }
                    tracing::debug!(
                        operation = label,
                        attempt,
                        error = %error,
                        "operation failed, retrying"
                    );
                    attempt += 1;
                }
            }
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    initial_backoff: Option<Duration>,
    multiplier: Option<u32>,
    max_backoff: Option<Duration>,
}

impl RetryPolicyBuilder {
    /// Sets the total number of attempts.
    #[must_use]
    pub const fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Sets the delay before the second attempt.
    #[must_use]
    pub const fn initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = Some(delay);
        self
    }

    /// Sets the backoff growth factor.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Sets the backoff cap.
    #[must_use]
    pub const fn max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = Some(delay);
        self
    }

    /// Builds the policy.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            initial_backoff: self.initial_backoff.unwrap_or(defaults.initial_backoff),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
            max_backoff: self.max_backoff.unwrap_or(defaults.max_backoff),
        }
    }
}
