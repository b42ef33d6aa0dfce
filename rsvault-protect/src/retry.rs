//! Bounded retry of transient control plane failures.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::RemoteError;

/// Sleep for `delay` unless `cancel` fires first.
///
/// Returns `false` when cancelled.
pub async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempts run out.
///
/// Only [`RemoteError::is_transient`] failures are retried. A `Retry-After`
/// hint from the server takes precedence over the policy's backoff.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(RemoteError::Cancelled);
        }

        match op().await {
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = e.retry_after().unwrap_or_else(|| policy.backoff(attempt));
                warn!(
                    operation = what,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient control plane error, retrying"
                );
                if !sleep_or_cancel(cancel, delay).await {
                    return Err(RemoteError::Cancelled);
                }
                attempt += 1;
            }
            other => return other,
        }
    }
}
