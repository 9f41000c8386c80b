//! The signal `monitoring` and canary analysis gate on (spec §4.4.1,
//! §4.4.2): error rate of a deployment's group over a window. Abstracted the
//! same way [`crate::health::HealthProbe`] abstracts the health endpoint, so
//! the state machine's rollback/promote logic is testable without a real
//! metrics backend.

use std::time::Duration;

use async_trait::async_trait;
use cd_common::Error;

#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn error_rate(&self, deployment_ref: &str, group: &str, window: Duration) -> Result<f64, Error>;
}

/// Used where no metrics backend is wired up; always reports a clean group,
/// so strategies that call into monitoring still converge to `completed`.
pub struct ZeroMetricsSource;

#[async_trait]
impl MetricsSource for ZeroMetricsSource {
    async fn error_rate(&self, _deployment_ref: &str, _group: &str, _window: Duration) -> Result<f64, Error> {
        Ok(0.0)
    }
}

#[cfg(test)]
pub struct ScriptedMetricsSource(pub f64);

#[cfg(test)]
#[async_trait]
impl MetricsSource for ScriptedMetricsSource {
    async fn error_rate(&self, _deployment_ref: &str, _group: &str, _window: Duration) -> Result<f64, Error> {
        Ok(self.0)
    }
}
