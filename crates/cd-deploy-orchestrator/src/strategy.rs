//! Strategy semantics (spec §4.4.2): pure functions over replica counts that
//! produce a rollout plan, independent of any runtime or store. Grounded on
//! `framework.rs`'s "detection is a pure function of inputs" shape -- the
//! orchestrator drives I/O, this module only computes the plan.

use cd_common::model::{Group, Strategy};

#[derive(Clone, Debug, PartialEq)]
pub struct RolloutBatch {
    pub group: Group,
    pub replicas: u32,
    /// Cumulative traffic percentage the new side should hold once this
    /// batch finishes deploying and passes health checks.
    pub traffic_pct_after: u8,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CanaryPlan {
    pub canary_traffic_pct: u8,
    pub error_rate_threshold: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RolloutPlan {
    pub batches: Vec<RolloutBatch>,
    /// recreate: old group is stopped before any new container starts.
    pub stop_old_first: bool,
    /// canary only: the analysis gate between holding and promoting.
    pub canary: Option<CanaryPlan>,
}

pub const DEFAULT_BATCH_SIZE: u32 = 2;
pub const DEFAULT_CANARY_TRAFFIC_PCT: u8 = 10;
pub const DEFAULT_CANARY_ERROR_THRESHOLD: f64 = 0.05;

/// Builds the sequence of batches a deployment must work through, per the
/// strategy table in spec §4.4.2. `batch_size` only affects `rolling`.
pub fn plan(
    strategy: Strategy,
    replicas: u32,
    batch_size: u32,
    canary_traffic_pct: u8,
) -> RolloutPlan {
    match strategy {
        Strategy::BlueGreen => RolloutPlan {
            batches: vec![RolloutBatch {
                group: Group::Green,
                replicas,
                traffic_pct_after: 100,
            }],
            stop_old_first: false,
            canary: None,
        },
        Strategy::Recreate => RolloutPlan {
            batches: vec![RolloutBatch {
                group: Group::Green,
                replicas,
                traffic_pct_after: 100,
            }],
            stop_old_first: true,
            canary: None,
        },
        Strategy::Rolling => {
            let size = batch_size.max(1);
            let mut batches = Vec::new();
            let mut deployed = 0u32;
            let mut index = 0u32;
            while deployed < replicas {
                let this_batch = size.min(replicas - deployed);
                deployed += this_batch;
                let traffic_pct_after = ((deployed as u64 * 100) / replicas as u64) as u8;
                batches.push(RolloutBatch {
                    group: Group::Batch(index),
                    replicas: this_batch,
                    traffic_pct_after,
                });
                index += 1;
            }
            RolloutPlan {
                batches,
                stop_old_first: false,
                canary: None,
            }
        }
        Strategy::Canary => RolloutPlan {
            batches: vec![RolloutBatch {
                group: Group::Canary,
                replicas: 1,
                traffic_pct_after: canary_traffic_pct,
            }],
            stop_old_first: false,
            canary: Some(CanaryPlan {
                canary_traffic_pct,
                error_rate_threshold: DEFAULT_CANARY_ERROR_THRESHOLD,
            }),
        },
    }
}

/// Canary analysis (spec §4.4.2, §8 S3): compares the canary's observed
/// error rate against the threshold. p95 latency comparison is left to the
/// caller's metrics source; this crate only gates on error rate, which is
/// the only signal every deployment has (an HTTP health probe failing counts
/// toward it).
pub fn canary_passes(observed_error_rate: f64, threshold: f64) -> bool {
    observed_error_rate <= threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blue_green_is_a_single_full_size_batch_to_100() {
        let p = plan(Strategy::BlueGreen, 3, DEFAULT_BATCH_SIZE, DEFAULT_CANARY_TRAFFIC_PCT);
        assert_eq!(p.batches.len(), 1);
        assert_eq!(p.batches[0].replicas, 3);
        assert_eq!(p.batches[0].traffic_pct_after, 100);
        assert!(!p.stop_old_first);
    }

    #[test]
    fn recreate_stops_old_group_before_starting_new() {
        let p = plan(Strategy::Recreate, 2, DEFAULT_BATCH_SIZE, DEFAULT_CANARY_TRAFFIC_PCT);
        assert!(p.stop_old_first);
        assert_eq!(p.batches[0].traffic_pct_after, 100);
    }

    #[test]
    fn rolling_splits_into_sequential_batches_with_cumulative_traffic() {
        let p = plan(Strategy::Rolling, 4, 2, DEFAULT_CANARY_TRAFFIC_PCT);
        assert_eq!(p.batches.len(), 2);
        assert_eq!(p.batches[0].replicas, 2);
        assert_eq!(p.batches[0].traffic_pct_after, 50);
        assert_eq!(p.batches[1].replicas, 2);
        assert_eq!(p.batches[1].traffic_pct_after, 100);
    }

    #[test]
    fn rolling_handles_a_remainder_batch_smaller_than_batch_size() {
        let p = plan(Strategy::Rolling, 5, 2, DEFAULT_CANARY_TRAFFIC_PCT);
        assert_eq!(p.batches.len(), 3);
        assert_eq!(p.batches[2].replicas, 1);
        assert_eq!(p.batches[2].traffic_pct_after, 100);
    }

    #[test]
    fn canary_deploys_a_single_replica_and_holds_for_analysis() {
        let p = plan(Strategy::Canary, 5, DEFAULT_BATCH_SIZE, 10);
        assert_eq!(p.batches.len(), 1);
        assert_eq!(p.batches[0].replicas, 1);
        assert_eq!(p.batches[0].traffic_pct_after, 10);
        assert!(p.canary.is_some());
    }

    #[test]
    fn canary_analysis_fails_above_threshold() {
        assert!(canary_passes(0.02, 0.05));
        assert!(!canary_passes(0.12, 0.05));
    }
}
