//! Deployment redelivery policy (spec §4.4, "Retry policy"): the bus header
//! and the `Deployment.retry_count` row both count attempts; the stricter of
//! the two governs. Exceeding it is a permanent failure, not a transient one,
//! so this is deliberately separate from `cd_common::retry`'s I/O backoff.

use cd_common::model::Deployment;

pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Proceed,
    ExceededBudget,
}

/// `header_redelivery_count` is whatever the bus reports for this message
/// (e.g. AMQP's `x-death` count); `row_retry_count` is `Deployment.retry_count`
/// read before this attempt began.
pub fn decide(header_redelivery_count: u32, row_retry_count: u32, max: u32) -> RetryDecision {
    if header_redelivery_count.max(row_retry_count) >= max {
        RetryDecision::ExceededBudget
    } else {
        RetryDecision::Proceed
    }
}

/// Appends this attempt's failure to the deployment's retry bookkeeping.
/// Called once per failed attempt, before deciding whether to redeliver.
pub fn record_failure(deployment: &mut Deployment, reason: impl Into<String>) {
    deployment.retry_count += 1;
    deployment.retry_errors.push(reason.into());
}

#[cfg(test)]
mod tests {
    use super::*;
    use cd_common::ids::{BuildId, DeploymentId, ProjectRef};
    use cd_common::model::{DeploymentStatus, Environment, Strategy};

    fn deployment() -> Deployment {
        Deployment {
            id: DeploymentId::new(),
            project_ref: ProjectRef::new(),
            build_ref: BuildId::new(),
            environment: Environment::Production,
            strategy: Strategy::BlueGreen,
            status: DeploymentStatus::Deploying,
            domain: None,
            subdomain: None,
            replicas: 2,
            traffic_pct: 0,
            retry_count: 0,
            retry_errors: Vec::new(),
            error: None,
            branch: "main".into(),
            preview_expires_at: None,
        }
    }

    #[test]
    fn proceeds_while_under_budget_on_both_counters() {
        assert_eq!(decide(1, 1, DEFAULT_MAX_RETRIES), RetryDecision::Proceed);
    }

    #[test]
    fn the_stricter_counter_wins_when_header_is_ahead() {
        assert_eq!(
            decide(DEFAULT_MAX_RETRIES, 0, DEFAULT_MAX_RETRIES),
            RetryDecision::ExceededBudget
        );
    }

    #[test]
    fn the_stricter_counter_wins_when_row_is_ahead() {
        assert_eq!(
            decide(0, DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRIES),
            RetryDecision::ExceededBudget
        );
    }

    #[test]
    fn record_failure_appends_and_increments() {
        let mut d = deployment();
        record_failure(&mut d, "health check timed out");
        record_failure(&mut d, "health check timed out");
        assert_eq!(d.retry_count, 2);
        assert_eq!(d.retry_errors.len(), 2);
    }
}
