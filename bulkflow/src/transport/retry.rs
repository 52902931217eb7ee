//! Bounded retries with jittered delay for transport calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{TransportError, TransportErrorKind};
use crate::cancellation::CancellationToken;

fn default_max_attempts() -> u32 {
    10
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_jitter_ms() -> u64 {
    2_000
}

fn default_retry_on() -> Vec<TransportErrorKind> {
    vec![
        TransportErrorKind::Connect,
        TransportErrorKind::Timeout,
        TransportErrorKind::Server,
    ]
}

/// Retry tuning for one call site.
///
/// Each retry waits `base_delay + uniform(0, jitter)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed part of the delay between attempts, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound of the random extra delay, in milliseconds.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// Error kinds worth retrying.
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<TransportErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            jitter_ms: default_jitter_ms(),
            retry_on: default_retry_on(),
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub const fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the jitter range.
    #[must_use]
    pub const fn with_jitter_ms(mut self, jitter: u64) -> Self {
        self.jitter_ms = jitter;
        self
    }

    /// Replaces the retryable error kinds.
    #[must_use]
    pub fn with_retry_on(mut self, kinds: impl IntoIterator<Item = TransportErrorKind>) -> Self {
        self.retry_on = kinds.into_iter().collect();
        self
    }

    /// Whether an error of this kind is retried.
    #[must_use]
    pub fn is_retryable(&self, kind: TransportErrorKind) -> bool {
        self.retry_on.contains(&kind)
    }

    /// Draws the delay before the next attempt.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        Duration::from_millis(self.base_delay_ms.saturating_add(jitter))
    }

    /// Rejects policies that could never make a call.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        Ok(())
    }

    /// Runs a transport operation under this policy.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, RetryError<TransportError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        with_retry(self, label, cancel, |e: &TransportError| self.is_retryable(e.kind), operation)
            .await
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// The last error.
        last: E,
    },

    /// An attempt failed with an error that is not retried.
    #[error("non-retryable error on attempt {attempts}: {error}")]
    Rejected {
        /// Attempts made, including the rejected one.
        attempts: u32,
        /// The error.
        error: E,
    },

    /// The cancellation token fired before or between attempts.
    #[error("cancelled after {attempts} attempt(s): {reason}")]
    Cancelled {
        /// Attempts made.
        attempts: u32,
        /// The cancellation reason.
        reason: String,
        /// The error that scheduled the interrupted wait, if any.
        last: Option<E>,
    },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::Rejected { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Executes an operation, retrying errors `is_retryable` accepts.
///
/// Makes at most `policy.max_attempts` calls. A non-retryable error returns
/// at once without sleeping. The sleep between attempts ends early when
/// `cancel` fires.
pub async fn with_retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    label: &str,
    cancel: &CancellationToken,
    is_retryable: R,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled {
                attempts: attempt,
                reason: cancel.reason().unwrap_or_default(),
                last: None,
            });
        }

        attempt += 1;
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !is_retryable(&error) {
            tracing::debug!(label, attempt, error = %error, "Non-retryable error");
            return Err(RetryError::Rejected {
                attempts: attempt,
                error,
            });
        }

        if attempt >= max_attempts {
            tracing::warn!(label, attempts = attempt, error = %error, "Retries exhausted");
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: error,
            });
        }

        let delay = policy.next_delay();
        tracing::debug!(
            label,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Retrying after error"
        );

        let interrupted = tokio::select! {
            () = cancel.cancelled() => true,
            () = tokio::time::sleep(delay) => false,
        };
        if interrupted {
            return Err(RetryError::Cancelled {
                attempts: attempt,
                reason: cancel.reason().unwrap_or_default(),
                last: Some(error),
            });
        }
    }
}
