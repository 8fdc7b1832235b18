//! Environment-driven configuration.
//!
//! Every field maps to a `COURIER_`-prefixed variable, e.g.
//! `COURIER_PROVIDER_DELAY_MS=250`. Unset variables take the defaults below.

use std::time::Duration;

use serde::Deserialize;

use crate::queue::{QueueSettings, RetryPolicy};
use crate::service::SendJobPolicy;
use crate::worker::ProcessorSettings;

const ENV_PREFIX: &str = "COURIER_";

#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(#[from] envy::Error);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Simulated provider round trip.
    pub provider_delay_ms: u64,
    /// SENT -> DELIVERED.
    pub delivered_delay_ms: u64,
    /// DELIVERED -> READ.
    pub read_delay_ms: u64,
    /// Probability that a provider call fails. Clamped to `[0, 1]`.
    pub provider_fail_rate: f64,
    pub send_attempts: u32,
    pub backoff_base_ms: u64,
    pub worker_concurrency: usize,
    pub lease_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider_delay_ms: 500,
            delivered_delay_ms: 1000,
            read_delay_ms: 2000,
            provider_fail_rate: 0.0,
            send_attempts: 3,
            backoff_base_ms: 1000,
            worker_concurrency: 1,
            lease_timeout_ms: 30_000,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(envy::prefixed(ENV_PREFIX).from_env::<Self>()?)
    }

    /// Same as [`Config::load`], from explicit pairs instead of the process
    /// environment.
    pub fn from_pairs<I>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::prefixed(ENV_PREFIX).from_iter::<_, Self>(pairs)?)
    }

    pub fn provider_delay(&self) -> Duration {
        Duration::from_millis(self.provider_delay_ms)
    }

    pub fn delivered_delay(&self) -> Duration {
        Duration::from_millis(self.delivered_delay_ms)
    }

    pub fn read_delay(&self) -> Duration {
        Duration::from_millis(self.read_delay_ms)
    }

    pub fn fail_rate(&self) -> f64 {
        if self.provider_fail_rate.is_nan() {
            return 0.0;
        }
        self.provider_fail_rate.clamp(0.0, 1.0)
    }

    pub fn worker_concurrency(&self) -> usize {
        self.worker_concurrency.max(1)
    }

    pub fn send_policy(&self) -> SendJobPolicy {
        SendJobPolicy {
            retry: RetryPolicy::exponential(
                self.send_attempts,
                Duration::from_millis(self.backoff_base_ms),
            ),
        }
    }

    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            delivered_delay: self.delivered_delay(),
            read_delay: self.read_delay(),
        }
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            lease_timeout: Duration::from_millis(self.lease_timeout_ms),
        }
    }
}
