//! Bounded retry for hardware commands.
//
// Transport writes are retried a fixed number of times with a short pause
// between attempts. The caller decides what an exhausted retry means for the
// current point or the whole scan.

use crate::error::ProbeError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt bound and backoff in milliseconds.
    pub fn new(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_delay: Duration::from_millis(backoff_ms),
        }
    }
}

/// Runs `op` until it succeeds or the policy is exhausted.
///
/// Each attempt gets a fresh future from `op`, so any lock taken inside the
/// operation is released between attempts. On exhaustion the last error is
/// reported as [`ProbeError::Transport`].
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, ProbeError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProbeError>>,
{
    let mut last_reason = String::new();
    for attempt in 1..=policy.max_attempts {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            // Lock timeouts are not transient at this level
            Err(err @ ProbeError::LockTimeout { .. }) => return Err(err),
            Err(err) => {
                warn!(label, attempt, error = %err, "Hardware command attempt failed");
                last_reason = err.to_string();
                if attempt < policy.max_attempts {
                    sleep(policy.backoff_delay).await;
                }
            }
        }
    }
    Err(ProbeError::Transport {
        attempts: policy.max_attempts,
        reason: last_reason,
    })
}
