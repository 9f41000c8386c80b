//! Replica health polling (spec §4.4.1 "health_checking"): require
//! `consecutive_successful_checks >= K` within `max_wait`.

use std::time::Duration;

use async_trait::async_trait;
use cd_common::Error;
use tracing::debug;

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Performs one check against the replica's declared health endpoint.
    /// `Ok(true)` is a pass, `Ok(false)` is a clean fail (non-2xx), `Err` is
    /// a probe-level failure (connection refused, DNS, etc.) treated the
    /// same as a fail for the purposes of the streak counter.
    async fn check(&self, internal_ip: &str, port: u16) -> Result<bool, Error>;
}

pub struct HttpHealthProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpHealthProbe {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, internal_ip: &str, port: u16) -> Result<bool, Error> {
        let url = format!("http://{internal_ip}:{port}{}", self.path);
        match self.client.get(&url).send().await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(e) => {
                debug!(url, error = %e, "health probe failed");
                Ok(false)
            }
        }
    }
}

pub struct HealthPolicy {
    pub interval: Duration,
    pub threshold: u32,
    pub max_wait: Duration,
}

/// Polls until `threshold` consecutive passes are observed, or `max_wait`
/// elapses. A failing check resets the streak to zero, matching "any
/// replica failing -> group fails" (spec §4.4.1) being decided by the
/// caller once this returns `Ok(false)`.
pub async fn wait_for_healthy(
    probe: &dyn HealthProbe,
    internal_ip: &str,
    port: u16,
    policy: &HealthPolicy,
) -> Result<bool, Error> {
    let deadline = tokio::time::Instant::now() + policy.max_wait;
    let mut streak = 0u32;

    while tokio::time::Instant::now() < deadline {
        let passed = probe.check(internal_ip, port).await?;
        streak = if passed { streak + 1 } else { 0 };
        if streak >= policy.threshold {
            return Ok(true);
        }
        tokio::time::sleep(policy.interval).await;
    }

    Ok(false)
}

pub fn default_policy() -> HealthPolicy {
    HealthPolicy {
        interval: Duration::from_secs(2),
        threshold: 3,
        max_wait: Duration::from_secs(300),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedProbe {
        results: Vec<bool>,
        call: AtomicU32,
    }

    #[async_trait::async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn check(&self, _ip: &str, _port: u16) -> Result<bool, Error> {
            let i = self.call.fetch_add(1, Ordering::SeqCst) as usize;
            Ok(*self.results.get(i).unwrap_or(&false))
        }
    }

    #[tokio::test]
    async fn passes_after_threshold_consecutive_successes() {
        let probe = ScriptedProbe {
            results: vec![true, true, true],
            call: AtomicU32::new(0),
        };
        let policy = HealthPolicy {
            interval: Duration::from_millis(1),
            threshold: 3,
            max_wait: Duration::from_secs(5),
        };
        assert!(wait_for_healthy(&probe, "10.0.0.1", 8080, &policy)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn a_failure_resets_the_streak() {
        let probe = ScriptedProbe {
            results: vec![true, true, false, true, true, true],
            call: AtomicU32::new(0),
        };
        let policy = HealthPolicy {
            interval: Duration::from_millis(1),
            threshold: 3,
            max_wait: Duration::from_secs(5),
        };
        assert!(wait_for_healthy(&probe, "10.0.0.1", 8080, &policy)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn never_reaching_threshold_times_out_to_false() {
        let probe = ScriptedProbe {
            results: vec![false; 100],
            call: AtomicU32::new(0),
        };
        let policy = HealthPolicy {
            interval: Duration::from_millis(1),
            threshold: 3,
            max_wait: Duration::from_millis(20),
        };
        assert!(!wait_for_healthy(&probe, "10.0.0.1", 8080, &policy)
            .await
            .unwrap());
    }
}
