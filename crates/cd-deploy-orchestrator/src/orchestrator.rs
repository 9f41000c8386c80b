//! Drives one deployment through its strategy's state machine (spec §4.4,
//! §4.4.1, §4.4.2). Grounded on `deployer/src/deployment/mod.rs`'s
//! one-pipeline-per-unit-of-work shape and the `BuildWorker::process`
//! pattern this crate's sibling uses: reserve a ticket, run the steps, always
//! release, turn any error into a terminal outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use cd_common::ids::{DeploymentId, TenantRef};
use cd_common::model::{
    Container, ContainerStatus, Deployment, DeploymentStatus, EventKind, Phase, PhaseTransition,
    RoutingRule, Severity, Strategy, StrategyState,
};
use cd_common::Error;
use cd_broker::EventBroker;
use cd_qrl::limiter::{Limits, QuotaLimiter};
use cd_qrl::scoped::TicketGuard;
use cd_common::routing::RoutingPublisher;
use tracing::{info, instrument, warn};
use ulid::Ulid;

use crate::containers::{ContainerRuntime, ContainerSpec};
use crate::health::{wait_for_healthy, HealthPolicy, HealthProbe};
use crate::message::DeployTriggered;
use crate::metrics::MetricsSource;
use crate::retry::{self, RetryDecision};
use crate::store::DeploymentStore;
use crate::strategy::{self, RolloutBatch};

pub struct OrchestratorConfig {
    pub health_policy: HealthPolicy,
    pub batch_size: u32,
    pub canary_traffic_pct: u8,
    pub canary_hold: Duration,
    pub monitor_window: Duration,
    pub error_rate_threshold: f64,
    pub max_retries: u32,
    pub container_port: u16,
    pub network: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_policy: crate::health::default_policy(),
            batch_size: strategy::DEFAULT_BATCH_SIZE,
            canary_traffic_pct: strategy::DEFAULT_CANARY_TRAFFIC_PCT,
            canary_hold: Duration::from_secs(300),
            monitor_window: Duration::from_secs(60),
            error_rate_threshold: strategy::DEFAULT_CANARY_ERROR_THRESHOLD,
            max_retries: retry::DEFAULT_MAX_RETRIES,
            container_port: 8000,
            network: "cd-net".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeployOutcome {
    pub deployment_id: DeploymentId,
    pub status: DeploymentStatus,
    pub error: Option<String>,
}

pub struct DeployOrchestrator {
    store: Arc<dyn DeploymentStore>,
    runtime: Arc<dyn ContainerRuntime>,
    routing: Arc<dyn RoutingPublisher>,
    probe: Arc<dyn HealthProbe>,
    metrics: Arc<dyn MetricsSource>,
    quota: Arc<dyn QuotaLimiter>,
    broker: EventBroker,
    config: OrchestratorConfig,
}

impl DeployOrchestrator {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        runtime: Arc<dyn ContainerRuntime>,
        routing: Arc<dyn RoutingPublisher>,
        probe: Arc<dyn HealthProbe>,
        metrics: Arc<dyn MetricsSource>,
        quota: Arc<dyn QuotaLimiter>,
        broker: EventBroker,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            routing,
            probe,
            metrics,
            quota,
            broker,
            config,
        }
    }

    #[instrument(skip_all, fields(deployment_id = %msg.deployment_id))]
    pub async fn process(
        &self,
        tenant: TenantRef,
        limits: Limits,
        msg: DeployTriggered,
        header_redelivery_count: u32,
    ) -> DeployOutcome {
        let deployment_id = msg.deployment_id;
        let row_retry_count = match self.store.get_deployment(deployment_id).await {
            Ok(existing) => existing.retry_count,
            Err(_) => 0,
        };

        if retry::decide(header_redelivery_count, row_retry_count, self.config.max_retries)
            == RetryDecision::ExceededBudget
        {
            return self.fail_permanently(deployment_id, "redelivery budget exhausted").await;
        }

        let idempotency_key = deployment_id.to_string();
        let ticket = match self
            .quota
            .reserve_deployment(tenant, &idempotency_key, limits)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                return DeployOutcome {
                    deployment_id,
                    status: DeploymentStatus::Failed,
                    error: Some(e.to_string()),
                }
            }
        };
        let guard = TicketGuard::new(ticket, self.quota.clone());

        let outcome = self.run_steps(&msg).await;
        guard.release().await;

        match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                let mut deployment = self
                    .store
                    .get_deployment(deployment_id)
                    .await
                    .unwrap_or_else(|_| new_deployment(&msg));
                retry::record_failure(&mut deployment, e.to_string());
                let _ = self.store.put_deployment(deployment.clone()).await;

                self.emit(deployment_id, EventKind::Phase, Severity::Critical, serde_json::json!({
                    "phase": "failed",
                    "error": e.to_string(),
                }))
                .await;
                let _ = self
                    .store
                    .transition_status(deployment_id, DeploymentStatus::Deploying, DeploymentStatus::Failed)
                    .await;

                DeployOutcome {
                    deployment_id,
                    status: DeploymentStatus::Failed,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn fail_permanently(&self, deployment_id: DeploymentId, reason: &str) -> DeployOutcome {
        if let Ok(mut deployment) = self.store.get_deployment(deployment_id).await {
            deployment.status = DeploymentStatus::Failed;
            let _ = self.store.put_deployment(deployment).await;
        }
        if let Some(mut state) = self
            .store
            .get_strategy_state(deployment_id)
            .await
            .ok()
            .flatten()
        {
            if let Err(e) = self.transition(&mut state, Phase::Failed, Some(reason.into())).await {
                warn!(deployment_id = %deployment_id, error = %e, "failed to record phase transition on retry exhaustion");
            }
        } else {
            self.emit(
                deployment_id,
                EventKind::Phase,
                Severity::Critical,
                serde_json::json!({ "phase": "failed", "reason": reason }),
            )
            .await;
        }

        DeployOutcome {
            deployment_id,
            status: DeploymentStatus::Failed,
            error: Some(reason.to_string()),
        }
    }

    async fn run_steps(&self, msg: &DeployTriggered) -> Result<DeployOutcome, Error> {
        let deployment_id = msg.deployment_id;
        let mut deployment = new_deployment(msg);
        self.store.put_deployment(deployment.clone()).await?;

        let prior = self
            .store
            .find_active_deployment(msg.project_ref, msg.deployment.environment, &msg.build.branch)
            .await?;

        let mut state = StrategyState {
            deployment_ref: deployment_id,
            phase: Phase::Pending,
            active_group: prior.as_ref().and_then(|p| p.domain.clone()).map(|_| "stable".into()),
            standby_group: None,
            batches_completed: 0,
            total_batches: 0,
            canary_traffic_pct: self.config.canary_traffic_pct,
            canary_passed: None,
        };

        self.transition(&mut state, Phase::Preparing, None).await?;

        let plan = strategy::plan(
            msg.deployment.strategy,
            msg.deployment.replicas,
            self.config.batch_size,
            self.config.canary_traffic_pct,
        );
        state.total_batches = plan.batches.len() as u32;
        self.store.put_strategy_state(state.clone()).await?;

        if plan.stop_old_first {
            if let Some(prior) = &prior {
                self.drain_deployment(prior.id).await;
            }
        }

        self.transition(&mut state, Phase::DeployingNew, None).await?;

        let internal_only = msg.deployment.domain.is_none() && msg.deployment.subdomain.is_none();
        let mut started: Vec<Container> = Vec::new();
        let mut failed_health = false;

        for batch in &plan.batches {
            let batch_containers = self.start_batch(deployment_id, batch, msg).await?;

            self.transition(&mut state, Phase::HealthChecking, None).await?;
            let healthy = self.check_batch_health(&batch_containers).await?;
            if !healthy {
                failed_health = true;
                for c in &batch_containers {
                    self.runtime.stop_and_remove(&c.runtime_id).await.ok();
                    self.store.delete_container(c.id).await.ok();
                }
                break;
            }

            for c in &batch_containers {
                self.store.put_container(c.clone()).await?;
            }
            started.extend(batch_containers);

            if !internal_only && !matches!(msg.deployment.strategy, Strategy::Canary) {
                self.transition(&mut state, Phase::SwitchingTraffic, None).await?;
                self.publish_traffic(msg, &prior, &started, batch.traffic_pct_after)
                    .await?;
                state.batches_completed += 1;
                self.store.put_strategy_state(state.clone()).await?;
            }
        }

        if failed_health {
            return self
                .rollback(
                    &mut deployment,
                    &mut state,
                    msg,
                    &prior,
                    &started,
                    "replica failed health check",
                )
                .await;
        }

        if let Some(canary) = &plan.canary {
            tokio::time::sleep(self.config.canary_hold).await;
            let error_rate = self
                .metrics
                .error_rate(&deployment_id.to_string(), "canary", self.config.canary_hold)
                .await?;
            let passed = strategy::canary_passes(error_rate, canary.error_rate_threshold);
            state.canary_passed = Some(passed);
            self.store.put_strategy_state(state.clone()).await?;

            if !passed {
                for c in &started {
                    self.runtime.stop_and_remove(&c.runtime_id).await.ok();
                    self.store.delete_container(c.id).await.ok();
                }
                self.transition(&mut state, Phase::Failed, Some("canary analysis failed".into()))
                    .await?;
                deployment.status = DeploymentStatus::Failed;
                self.store.put_deployment(deployment.clone()).await?;
                self.emit(
                    deployment_id,
                    EventKind::Phase,
                    Severity::Critical,
                    serde_json::json!({ "phase": "failed", "reason": "canary analysis failed" }),
                )
                .await;
                return Ok(DeployOutcome {
                    deployment_id,
                    status: DeploymentStatus::Failed,
                    error: Some("canary analysis failed".into()),
                });
            }

            if !internal_only {
                self.transition(&mut state, Phase::SwitchingTraffic, None).await?;
                self.publish_traffic(msg, &prior, &started, 100).await?;
            }
        }

        self.transition(&mut state, Phase::Monitoring, None).await?;
        let group_label = started.first().map(|c| c.group.clone()).unwrap_or_default();
        let error_rate = self
            .metrics
            .error_rate(&deployment_id.to_string(), &group_label, self.config.monitor_window)
            .await?;
        if error_rate > self.config.error_rate_threshold {
            return self
                .rollback(&mut deployment, &mut state, msg, &prior, &started, "error rate threshold breached")
                .await;
        }

        if let Some(prior) = &prior {
            self.drain_deployment(prior.id).await;
        }

        deployment.status = DeploymentStatus::Active;
        deployment.traffic_pct = 100;
        deployment.retry_count = 0;
        deployment.retry_errors.clear();
        if msg.deployment.environment == cd_common::model::Environment::Preview {
            deployment.preview_expires_at = Some(Utc::now() + chrono::Duration::hours(24));
        }
        self.store.put_deployment(deployment.clone()).await?;
        self.transition(&mut state, Phase::Completed, None).await?;

        self.emit(deployment_id, EventKind::Complete, Severity::Info, serde_json::json!({
            "status": "active",
        }))
        .await;

        Ok(DeployOutcome {
            deployment_id,
            status: DeploymentStatus::Active,
            error: None,
        })
    }

    async fn start_batch(
        &self,
        deployment_id: DeploymentId,
        batch: &RolloutBatch,
        msg: &DeployTriggered,
    ) -> Result<Vec<Container>, Error> {
        // `DeployTriggered::parse` rejects empty `image_tags`, so `first()`
        // always has something; take the leading tag as the image reference
        // to run (the rest are additional registry tags for the same build).
        let image = msg
            .build
            .image_tags
            .first()
            .expect("DeployTriggered::parse rejects empty image_tags")
            .clone();

        let mut containers = Vec::with_capacity(batch.replicas as usize);
        for replica_index in 0..batch.replicas {
            let spec = ContainerSpec {
                name: format!("{deployment_id}-{}-{replica_index}", batch.group),
                image: image.clone(),
                port: self.config.container_port,
                // No merged-env/secrets source exists upstream of
                // `deploy.triggered` yet (§4.4.1's "fetch merged environment
                // variables and decrypt secrets" step); wire one in once a
                // secrets store and an env field land on the wire message.
                env: Vec::new(),
                network: self.config.network.clone(),
            };
            let (runtime_id, internal_ip) = self.runtime.start(&spec).await?;
            let container_id = cd_common::ids::ContainerId::new();

            self.emit(
                deployment_id,
                EventKind::Container,
                Severity::Info,
                serde_json::json!({ "group": batch.group.to_string(), "replica_index": replica_index }),
            )
            .await;

            containers.push(Container {
                id: container_id,
                deployment_ref: deployment_id,
                runtime_id,
                group: batch.group.to_string(),
                status: ContainerStatus::Starting,
                health_status: None,
                replica_index,
                is_active: false,
                is_primary: false,
                internal_ip,
                port: self.config.container_port,
            });
        }
        Ok(containers)
    }

    async fn check_batch_health(&self, containers: &[Container]) -> Result<bool, Error> {
        for container in containers {
            let Some(ip) = &container.internal_ip else {
                return Ok(false);
            };
            let healthy = wait_for_healthy(self.probe.as_ref(), ip, container.port, &self.config.health_policy)
                .await?;
            if !healthy {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn publish_traffic(
        &self,
        msg: &DeployTriggered,
        prior: &Option<Deployment>,
        new_containers: &[Container],
        new_pct: u8,
    ) -> Result<(), Error> {
        let new_group = new_containers
            .first()
            .map(|c| c.group.clone())
            .unwrap_or_default();
        let new_rule = RoutingRule {
            deployment_ref: msg.deployment_id,
            group: new_group,
            traffic_pct: new_pct,
            container_ids: new_containers.iter().map(|c| c.id).collect(),
            is_active: new_pct > 0,
        };
        self.routing.publish(msg.deployment_id, vec![new_rule]).await?;

        if let Some(prior) = prior {
            let remaining = 100u8.saturating_sub(new_pct);
            let prior_containers = self.store.list_containers(prior.id).await?;
            let prior_rule = RoutingRule {
                deployment_ref: prior.id,
                group: "stable".into(),
                traffic_pct: remaining,
                container_ids: prior_containers.iter().map(|c| c.id).collect(),
                is_active: remaining > 0,
            };
            self.routing.publish(prior.id, vec![prior_rule]).await?;
        }
        Ok(())
    }

    async fn rollback(
        &self,
        deployment: &mut Deployment,
        state: &mut StrategyState,
        msg: &DeployTriggered,
        prior: &Option<Deployment>,
        started: &[Container],
        reason: &str,
    ) -> Result<DeployOutcome, Error> {
        self.transition(state, Phase::RollingBack, Some(reason.to_string())).await?;

        for c in started {
            self.runtime.stop_and_remove(&c.runtime_id).await.ok();
            self.store.delete_container(c.id).await.ok();
        }

        if !matches!(msg.deployment.strategy, Strategy::Canary | Strategy::Rolling) {
            if let Some(prior) = prior {
                let prior_containers = self.store.list_containers(prior.id).await?;
                let restore_rule = RoutingRule {
                    deployment_ref: prior.id,
                    group: "stable".into(),
                    traffic_pct: 100,
                    container_ids: prior_containers.iter().map(|c| c.id).collect(),
                    is_active: true,
                };
                self.routing.publish(prior.id, vec![restore_rule]).await?;
            }
            self.routing.clear(msg.deployment_id).await?;
        }

        self.transition(state, Phase::Failed, Some(reason.to_string())).await?;
        deployment.status = DeploymentStatus::Failed;
        self.store.put_deployment(deployment.clone()).await?;

        self.emit(
            msg.deployment_id,
            EventKind::Phase,
            Severity::Critical,
            serde_json::json!({ "phase": "failed", "reason": reason }),
        )
        .await;

        Ok(DeployOutcome {
            deployment_id: msg.deployment_id,
            status: DeploymentStatus::Failed,
            error: Some(reason.to_string()),
        })
    }

    /// Stops and removes every container of a superseded deployment, then
    /// marks it `terminated`. Without the status transition the row stays
    /// `active` with zero containers, violating the "`active` requires at
    /// least one healthy container" invariant and corrupting
    /// `find_active_deployment` for every later rollout.
    async fn drain_deployment(&self, deployment_id: DeploymentId) {
        if let Ok(containers) = self.store.list_containers(deployment_id).await {
            for container in containers {
                self.runtime.stop_and_remove(&container.runtime_id).await.ok();
                self.store.delete_container(container.id).await.ok();
            }
        }
        if let Err(e) = self
            .store
            .transition_status(deployment_id, DeploymentStatus::Active, DeploymentStatus::Terminated)
            .await
        {
            warn!(deployment_id = %deployment_id, error = %e, "failed to mark superseded deployment terminated");
        }
    }

    async fn transition(
        &self,
        state: &mut StrategyState,
        to: Phase,
        reason: Option<String>,
    ) -> Result<(), Error> {
        let from = state.phase;
        let started = Instant::now();
        state.phase = to;
        self.store.put_strategy_state(state.clone()).await?;

        self.store
            .record_phase_transition(PhaseTransition {
                deployment_ref: state.deployment_ref,
                from,
                to,
                duration_seconds: started.elapsed().as_secs_f64(),
                reason: reason.clone(),
                occurred_at: Utc::now(),
            })
            .await?;

        info!(deployment_id = %state.deployment_ref, ?from, ?to, "phase transition");
        self.emit(
            state.deployment_ref,
            EventKind::Phase,
            Severity::Info,
            serde_json::json!({ "from": from.to_string(), "to": to.to_string(), "reason": reason }),
        )
        .await;
        Ok(())
    }

    async fn emit(
        &self,
        deployment_id: DeploymentId,
        kind: EventKind,
        severity: Severity,
        payload: serde_json::Value,
    ) {
        let resource_ref = resource_ulid(deployment_id);
        self.broker
            .publish(
                cd_common::model::ResourceType::Deployment,
                resource_ref,
                kind,
                severity,
                payload,
            )
            .await;
    }
}

fn resource_ulid(deployment_id: DeploymentId) -> Ulid {
    deployment_id
        .to_string()
        .parse()
        .expect("DeploymentId is always a valid Ulid")
}

fn new_deployment(msg: &DeployTriggered) -> Deployment {
    Deployment {
        id: msg.deployment_id,
        project_ref: msg.project_ref,
        build_ref: msg.build_id,
        environment: msg.deployment.environment,
        strategy: msg.deployment.strategy,
        status: DeploymentStatus::Deploying,
        domain: msg.deployment.domain.clone(),
        subdomain: msg.deployment.subdomain.clone(),
        replicas: msg.deployment.replicas,
        traffic_pct: 0,
        retry_count: 0,
        retry_errors: Vec::new(),
        error: None,
        branch: msg.build.branch.clone(),
        preview_expires_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::FakeRuntime;
    use crate::message::{BuildInfo, DeploymentSpec, ProjectInfo};
    use crate::metrics::ScriptedMetricsSource;
    use crate::store::InMemoryStore;
    use cd_common::ids::{BuildId, ProjectRef};
    use cd_common::model::QuotaDimension;
    use cd_common::routing::InMemoryRoutingPublisher;

    struct AlwaysHealthy;

    #[async_trait::async_trait]
    impl HealthProbe for AlwaysHealthy {
        async fn check(&self, _ip: &str, _port: u16) -> Result<bool, Error> {
            Ok(true)
        }
    }

    struct AlwaysUnhealthy;

    #[async_trait::async_trait]
    impl HealthProbe for AlwaysUnhealthy {
        async fn check(&self, _ip: &str, _port: u16) -> Result<bool, Error> {
            Ok(false)
        }
    }

    struct AllowAllQuota;

    #[async_trait::async_trait]
    impl QuotaLimiter for AllowAllQuota {
        async fn reserve_build(
            &self,
            _tenant: TenantRef,
            _idempotency_key: &str,
            _limits: Limits,
        ) -> cd_common::Result<cd_qrl::limiter::Ticket> {
            unimplemented!()
        }

        async fn reserve_deployment(
            &self,
            tenant: TenantRef,
            _idempotency_key: &str,
            _limits: Limits,
        ) -> cd_common::Result<cd_qrl::limiter::Ticket> {
            Ok(cd_qrl::limiter::testing::fake_ticket(tenant, QuotaDimension::ConcurrentDeployments))
        }

        async fn release(&self, _ticket: cd_qrl::limiter::Ticket) -> cd_common::Result<()> {
            Ok(())
        }

        async fn record_usage(
            &self,
            _tenant: TenantRef,
            _dimension: QuotaDimension,
            _delta: i64,
        ) -> cd_common::Result<()> {
            Ok(())
        }
    }

    fn msg(strategy: Strategy, replicas: u32) -> DeployTriggered {
        DeployTriggered {
            deployment_id: DeploymentId::new(),
            build_id: BuildId::new(),
            project_ref: ProjectRef::new(),
            project: ProjectInfo { slug: "acme".into(), name: "Acme".into() },
            build: BuildInfo {
                image_tags: vec!["img:sha1".into()],
                branch: "main".into(),
                commit: "abc".into(),
                metadata: serde_json::json!({}),
            },
            deployment: DeploymentSpec {
                environment: cd_common::model::Environment::Production,
                strategy,
                domain: Some("example.org".into()),
                subdomain: None,
                replicas,
            },
        }
    }

    fn healthy_orchestrator() -> DeployOrchestrator {
        DeployOrchestrator::new(
            Arc::new(InMemoryStore::new()),
            FakeRuntime::shared(),
            Arc::new(InMemoryRoutingPublisher::new()),
            Arc::new(AlwaysHealthy),
            Arc::new(ScriptedMetricsSource(0.0)),
            Arc::new(AllowAllQuota),
            EventBroker::new(Arc::new(cd_broker::NullSink)),
            OrchestratorConfig {
                canary_hold: Duration::from_millis(1),
                health_policy: HealthPolicy { interval: Duration::from_millis(1), threshold: 1, max_wait: Duration::from_secs(1) },
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn happy_blue_green_reaches_active_with_full_traffic() {
        let orchestrator = healthy_orchestrator();
        let limits = Limits { max_concurrent: 10, rate_per_minute: 100, monthly_allotment: 1000 };
        let outcome = orchestrator
            .process(TenantRef::new(), limits, msg(Strategy::BlueGreen, 2), 0)
            .await;
        assert_eq!(outcome.status, DeploymentStatus::Active);
    }

    #[tokio::test]
    async fn rolling_rollback_on_batch_health_failure() {
        let orchestrator = DeployOrchestrator::new(
            Arc::new(InMemoryStore::new()),
            FakeRuntime::shared(),
            Arc::new(InMemoryRoutingPublisher::new()),
            Arc::new(AlwaysUnhealthy),
            Arc::new(ScriptedMetricsSource(0.0)),
            Arc::new(AllowAllQuota),
            EventBroker::new(Arc::new(cd_broker::NullSink)),
            OrchestratorConfig {
                health_policy: HealthPolicy { interval: Duration::from_millis(1), threshold: 1, max_wait: Duration::from_millis(20) },
                ..Default::default()
            },
        );
        let limits = Limits { max_concurrent: 10, rate_per_minute: 100, monthly_allotment: 1000 };
        let outcome = orchestrator
            .process(TenantRef::new(), limits, msg(Strategy::Rolling, 4), 0)
            .await;
        assert_eq!(outcome.status, DeploymentStatus::Failed);
    }

    #[tokio::test]
    async fn canary_analysis_failure_does_not_touch_stable_traffic() {
        let orchestrator = DeployOrchestrator::new(
            Arc::new(InMemoryStore::new()),
            FakeRuntime::shared(),
            Arc::new(InMemoryRoutingPublisher::new()),
            Arc::new(AlwaysHealthy),
            Arc::new(ScriptedMetricsSource(0.12)),
            Arc::new(AllowAllQuota),
            EventBroker::new(Arc::new(cd_broker::NullSink)),
            OrchestratorConfig {
                canary_hold: Duration::from_millis(1),
                health_policy: HealthPolicy { interval: Duration::from_millis(1), threshold: 1, max_wait: Duration::from_secs(1) },
                ..Default::default()
            },
        );
        let limits = Limits { max_concurrent: 10, rate_per_minute: 100, monthly_allotment: 1000 };
        let outcome = orchestrator
            .process(TenantRef::new(), limits, msg(Strategy::Canary, 5), 0)
            .await;
        assert_eq!(outcome.status, DeploymentStatus::Failed);
    }

    #[tokio::test]
    async fn retry_exhaustion_skips_processing_entirely() {
        let orchestrator = healthy_orchestrator();
        let limits = Limits { max_concurrent: 10, rate_per_minute: 100, monthly_allotment: 1000 };
        let outcome = orchestrator
            .process(TenantRef::new(), limits, msg(Strategy::BlueGreen, 2), retry::DEFAULT_MAX_RETRIES)
            .await;
        assert_eq!(outcome.status, DeploymentStatus::Failed);
    }
}
