//! The entities the control plane owns or mutates (spec §3).
//!
//! Every status is a closed, tagged enum; the persisted string is the
//! serialization format produced by `sqlx::Type`, never the type itself
//! (spec §9's "string-typed statuses" redesign flag).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Type;

use crate::ids::{BuildId, ContainerId, DeploymentId, ProjectRef, TenantRef};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Type, strum::Display)]
#[sqlx(type_name = "build_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BuildStatus {
    Queued,
    Cloning,
    Installing,
    Building,
    Pushing,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl BuildStatus {
    /// Terminal states never transition further (spec §3 invariant).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Completed
                | BuildStatus::Failed
                | BuildStatus::Timeout
                | BuildStatus::Cancelled
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub project_ref: ProjectRef,
    pub commit: String,
    pub branch: String,
    pub status: BuildStatus,
    /// Ordered, unique. Non-empty iff `status == Completed`.
    pub image_tags: Vec<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl Build {
    pub fn new(id: BuildId, project_ref: ProjectRef, commit: String, branch: String) -> Self {
        Self {
            id,
            project_ref,
            commit,
            branch,
            status: BuildStatus::Queued,
            image_tags: Vec::new(),
            error: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
        }
    }

    /// Validates the invariant in spec §3: image_tags is non-empty iff the
    /// build is completed.
    pub fn invariant_holds(&self) -> bool {
        (self.status == BuildStatus::Completed) == !self.image_tags.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Type, strum::Display, strum::EnumString)]
#[sqlx(type_name = "environment", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Environment {
    Production,
    Staging,
    Preview,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Type, strum::Display, strum::EnumString)]
#[sqlx(type_name = "strategy", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Strategy {
    BlueGreen,
    Rolling,
    Canary,
    Recreate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Type, strum::Display)]
#[sqlx(type_name = "deployment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Active,
    Failed,
    RolledBack,
    Terminated,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub project_ref: ProjectRef,
    pub build_ref: BuildId,
    pub environment: Environment,
    pub strategy: Strategy,
    pub status: DeploymentStatus,
    pub domain: Option<String>,
    pub subdomain: Option<String>,
    pub replicas: u32,
    pub traffic_pct: u8,
    pub retry_count: u32,
    pub retry_errors: Vec<String>,
    pub error: Option<String>,
    pub branch: String,
    /// Set only for `environment == Preview` deployments (spec §4.4.2's
    /// TTL reaper supplement). `None` for production/staging.
    pub preview_expires_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn is_internal_only(&self) -> bool {
        self.domain.as_deref().unwrap_or("").is_empty()
    }

    pub fn is_expired_preview(&self, now: DateTime<Utc>) -> bool {
        self.environment == Environment::Preview
            && self.preview_expires_at.is_some_and(|exp| exp <= now)
    }
}

/// An element of the deployment state machine (spec §4.4.1). Persisted in
/// `StrategyState` and logged via `PhaseTransition`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Type, strum::Display, strum::EnumString)]
#[sqlx(type_name = "phase", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    Pending,
    Preparing,
    DeployingNew,
    HealthChecking,
    SwitchingTraffic,
    Monitoring,
    Completed,
    RollingBack,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Group {
    Blue,
    Green,
    Canary,
    Stable,
    Batch(u32),
}

impl std::fmt::Display for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Group::Blue => write!(f, "blue"),
            Group::Green => write!(f, "green"),
            Group::Canary => write!(f, "canary"),
            Group::Stable => write!(f, "stable"),
            Group::Batch(n) => write!(f, "batch-{n}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StrategyState {
    pub deployment_ref: DeploymentId,
    pub phase: Phase,
    pub active_group: Option<String>,
    pub standby_group: Option<String>,
    pub batches_completed: u32,
    pub total_batches: u32,
    pub canary_traffic_pct: u8,
    pub canary_passed: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub deployment_ref: DeploymentId,
    pub from: Phase,
    pub to: Phase,
    pub duration_seconds: f64,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Type, strum::Display)]
#[sqlx(type_name = "container_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ContainerStatus {
    Pending,
    Starting,
    Running,
    Healthy,
    Unhealthy,
    Stopping,
    Stopped,
    Failed,
}

impl ContainerStatus {
    /// Containers marked `is_active` must be in one of these (spec §3).
    pub fn may_be_active(&self) -> bool {
        matches!(self, ContainerStatus::Running | ContainerStatus::Healthy)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub deployment_ref: DeploymentId,
    /// The id the container runtime assigned (spec §9's redesign flag: this
    /// is never a ULID, so it is kept distinct from `id`, our own key).
    pub runtime_id: String,
    pub group: String,
    pub status: ContainerStatus,
    pub health_status: Option<String>,
    pub replica_index: u32,
    pub is_active: bool,
    pub is_primary: bool,
    pub internal_ip: Option<String>,
    pub port: u16,
}

impl Container {
    /// Invariant from spec §3: an active container must be running/healthy.
    pub fn invariant_holds(&self) -> bool {
        !self.is_active || self.status.may_be_active()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub deployment_ref: DeploymentId,
    pub group: String,
    pub traffic_pct: u8,
    pub container_ids: Vec<ContainerId>,
    pub is_active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Type, strum::Display)]
#[sqlx(type_name = "resource_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ResourceType {
    Build,
    Deployment,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Type, strum::Display)]
#[sqlx(type_name = "severity", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Critical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Type, strum::Display)]
#[sqlx(type_name = "event_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    Log,
    Phase,
    Container,
    Traffic,
    Complete,
    Heartbeat,
    Connected,
}

/// An append-only, monotone-per-resource record (spec §3, §4.5).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub sequence: u64,
    pub resource_type: ResourceType,
    pub resource_ref: ulid::Ulid,
    pub kind: EventKind,
    pub severity: Severity,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Type, strum::Display, strum::EnumString)]
#[sqlx(type_name = "quota_dimension", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QuotaDimension {
    ConcurrentBuilds,
    ConcurrentDeployments,
    BuildsPerMonth,
    DeploysPerMonth,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuotaCounter {
    pub tenant_ref: TenantRef,
    pub dimension: QuotaDimension,
    pub window: String,
    pub value: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{BuildId, ProjectRef};

    #[test]
    fn build_invariant_rejects_tags_without_completion() {
        let mut build = Build::new(BuildId::new(), ProjectRef::new(), "a".into(), "main".into());
        assert!(build.invariant_holds());
        build.image_tags.push("img:sha".into());
        assert!(!build.invariant_holds());
        build.status = BuildStatus::Completed;
        assert!(build.invariant_holds());
    }

    #[test]
    fn container_invariant_requires_active_to_be_healthy() {
        let c = Container {
            id: crate::ids::ContainerId::new(),
            deployment_ref: crate::ids::DeploymentId::new(),
            runtime_id: "docker-abc123".into(),
            group: "green".into(),
            status: ContainerStatus::Starting,
            health_status: None,
            replica_index: 0,
            is_active: true,
            is_primary: false,
            internal_ip: None,
            port: 8000,
        };
        assert!(!c.invariant_holds());
    }
}
