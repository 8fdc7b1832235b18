//! Provider port - the outbound carrier a `send` job hands the message to.
//!
//! Only simulated providers exist: one driven by configured latency and
//! failure probability, and a scripted one for tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::MessageRef;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The provider refused or dropped the message; worth retrying.
    #[error("{0}")]
    Rejected(String),
}

#[async_trait]
pub trait Provider: Send + Sync {
    async fn send(&self, message: &MessageRef) -> Result<(), ProviderError>;
}

/// Sleeps for `latency`, then fails with probability `fail_rate`.
#[derive(Debug, Clone)]
pub struct SimulatedProvider {
    latency: Duration,
    fail_rate: f64,
}

impl SimulatedProvider {
    pub const FAILURE: &'static str = "Simulated provider failure";

    pub fn new(latency: Duration, fail_rate: f64) -> Self {
        Self {
            latency,
            fail_rate: fail_rate.clamp(0.0, 1.0),
        }
    }

    pub fn fail_rate(&self) -> f64 {
        self.fail_rate
    }
}

#[async_trait]
impl Provider for SimulatedProvider {
    async fn send(&self, _message: &MessageRef) -> Result<(), ProviderError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if rand::random::<f64>() < self.fail_rate {
            return Err(ProviderError::Rejected(Self::FAILURE.to_string()));
        }
        Ok(())
    }
}

/// Fails the first `failures` calls, then succeeds.
#[derive(Debug)]
pub struct ScriptedProvider {
    remaining_failures: AtomicU32,
    calls: AtomicU32,
}

impl ScriptedProvider {
    pub fn failing(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    pub fn always_ok() -> Self {
        Self::failing(0)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn send(&self, _message: &MessageRef) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match left {
            Ok(left) => Err(ProviderError::Rejected(format!(
                "scripted failure (left={left})"
            ))),
            Err(_) => Ok(()),
        }
    }
}
