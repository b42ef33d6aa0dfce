//! Reconciler tunables.
//!
//! Durations are (de)serialized as whole seconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// How long and how often to poll a long-running operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Upper bound on the total wait for one operation.
    #[serde(with = "secs")]
    pub max_wait: Duration,
    /// First delay between status checks.
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    /// Cap for the growing delay between status checks.
    #[serde(with = "secs")]
    pub max_interval: Duration,
    /// Growth factor applied to the delay after each check.
    pub multiplier: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(60 * 60),
            poll_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(60),
            multiplier: 2,
        }
    }
}

impl PollConfig {
    /// Delay to use after `current`.
    pub fn next_interval(&self, current: Duration) -> Duration {
        current
            .saturating_mul(self.multiplier.max(1))
            .min(self.max_interval.max(self.poll_interval))
    }
}

/// Bounded retry of transient remote failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "secs")]
    pub initial_backoff: Duration,
    #[serde(with = "secs")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << exp)
            .min(self.max_backoff)
    }
}

/// Existence re-checks across the eventual consistency window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyPolicy {
    pub attempts: u32,
    #[serde(with = "secs")]
    pub interval: Duration,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            attempts: 12,
            interval: Duration::from_secs(10),
        }
    }
}

/// All reconciler tunables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub poll: PollConfig,
    pub retry: RetryPolicy,
    pub verify: VerifyPolicy,
}
