//! Retry/backoff for integration-style calls (webhook, model invocation).
//!
//! Pure nodes never go through this path.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::NodeError;

/// Delay curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayPolicy {
    Fixed,
    #[default]
    Exponential,
}

/// `{max attempts, delay policy}` as authored on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub delay: DelayPolicy,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay: DelayPolicy::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the `failed_attempt`-th attempt (1-based).
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let ms = match self.delay {
            DelayPolicy::Fixed => self.initial_delay_ms,
            DelayPolicy::Exponential => self
                .initial_delay_ms
                .saturating_mul(2u64.saturating_pow(failed_attempt.saturating_sub(1))),
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// Run `op` under `policy`, returning the final result and attempts made.
///
/// Only retryable errors are retried. Cancellation aborts the in-flight
/// attempt and any pending backoff sleep.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> (Result<T, NodeError>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, NodeError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return (Err(NodeError::Cancelled), attempt),
            r = op(attempt) => r,
        };

        match result {
            Ok(value) => return (Ok(value), attempt),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    call = label,
                    attempt,
                    max_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "retryable failure, backing off"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return (Err(NodeError::Cancelled), attempt),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => return (Err(err), attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            delay: DelayPolicy::Exponential,
            initial_delay_ms: 100,
            max_delay_ms: 300,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn fixed_delay_is_constant() {
        let policy = RetryPolicy {
            delay: DelayPolicy::Fixed,
            initial_delay_ms: 250,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(1), policy.delay_for(4));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let (result, attempts) = with_retry(&policy, &CancellationToken::new(), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(NodeError::network("503", true)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn late_success_is_returned() {
        let policy = RetryPolicy::default();
        let (result, attempts) = with_retry(&policy, &CancellationToken::new(), "test", |n| async move {
            if n < 3 {
                Err(NodeError::network("timeout", true))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let policy = RetryPolicy::default();
        let (result, attempts) = with_retry(&policy, &CancellationToken::new(), "test", |_| async {
            Err::<(), _>(NodeError::network("400 bad request", false))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_retries() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (result, _) = with_retry(&RetryPolicy::default(), &cancel, "test", |_| async {
            Err::<(), _>(NodeError::network("503", true))
        })
        .await;
        assert_eq!(result.unwrap_err(), NodeError::Cancelled);
    }
}
