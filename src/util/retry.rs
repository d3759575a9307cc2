use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::SyncResult;

/// Bounded exponential backoff for transient API failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempts run out. A server-provided retry-after wins over the schedule
/// but is still capped by `max_delay`.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut attempt = 0;
    let mut delay = policy.initial_delay;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(what, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() || attempt >= policy.max_attempts.max(1) => {
                return Err(err);
            }
            Err(err) => {
                let wait = err.retry_after().unwrap_or(delay).min(policy.max_delay);
                warn!(what, attempt, wait_ms = wait.as_millis() as u64, error = %err, "retrying");
                tokio::time::sleep(wait).await;
                delay = std::cmp::min(delay * 2, policy.max_delay);
            }
        }
    }
}
