//! Waits for long-running control plane operations.
//!
//! Each reconciliation owns its own poll loop. Between checks the loop
//! suspends on a timer that races the cancellation token, so a cancelled
//! reconciliation stops promptly instead of running to a terminal state.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clients::{AsyncOperation, ControlPlane, OperationStatus};
use crate::config::{PollConfig, RetryPolicy};
use crate::error::RemoteError;
use crate::retry::{sleep_or_cancel, with_retries};

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Succeeded(Option<Value>),
    Failed { code: String, message: String },
    /// `max_wait` elapsed first. The operation may still complete remotely.
    TimedOut(Duration),
    Cancelled,
    /// Status checks kept failing after retries.
    Unreachable(RemoteError),
}

pub struct AsyncOperationPoller {
    client: Arc<dyn ControlPlane>,
    config: PollConfig,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl AsyncOperationPoller {
    pub fn new(
        client: Arc<dyn ControlPlane>,
        config: PollConfig,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            config,
            retry,
            cancel,
        }
    }

    /// Wait using the configured bounds.
    pub async fn wait_default(&self, operation: AsyncOperation) -> PollOutcome {
        self.wait(operation, self.config.max_wait, self.config.poll_interval)
            .await
    }

    /// Wait for `operation` to reach a terminal state.
    ///
    /// The delay between checks starts at `poll_interval` and grows by the
    /// configured multiplier up to the configured cap. The total wait never
    /// exceeds `max_wait`.
    pub async fn wait(
        &self,
        operation: AsyncOperation,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> PollOutcome {
        let started = Instant::now();
        let deadline = started + max_wait;
        let mut interval = poll_interval.max(Duration::from_millis(1));
        let mut operation = operation;
        let mut checks = 0u32;

        loop {
            match operation.status {
                OperationStatus::Succeeded => {
                    info!(
                        checks,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Operation succeeded"
                    );
                    return PollOutcome::Succeeded(operation.result);
                }
                OperationStatus::Failed { code, message } => {
                    warn!(checks, %code, %message, "Operation failed");
                    return PollOutcome::Failed { code, message };
                }
                OperationStatus::InProgress => {}
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    location = %operation.location,
                    max_wait_secs = max_wait.as_secs(),
                    "Timeout waiting for operation"
                );
                return PollOutcome::TimedOut(max_wait);
            }

            let delay = interval.min(deadline - now);
            debug!(
                location = %operation.location,
                delay_ms = delay.as_millis() as u64,
                "Operation in progress"
            );
            if !sleep_or_cancel(&self.cancel, delay).await {
                info!(location = %operation.location, "Operation wait cancelled");
                return PollOutcome::Cancelled;
            }
            interval = self.config.next_interval(interval);
            checks += 1;

            let current = &operation;
            let refreshed = with_retries(&self.retry, &self.cancel, "operation status", move || {
                self.client.operation_status(current)
            })
            .await;

            operation = match refreshed {
                Ok(op) => op,
                Err(RemoteError::Cancelled) => return PollOutcome::Cancelled,
                Err(e) => {
                    warn!(
                        location = %operation.location,
                        error = %e,
                        "Failed to query operation status"
                    );
                    return PollOutcome::Unreachable(e);
                }
            };
        }
    }
}
