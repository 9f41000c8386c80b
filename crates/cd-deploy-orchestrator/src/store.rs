//! The durable-store seam (spec §3, §5): the orchestrator only ever
//! mutates rows through this trait, never holds a raw connection pool
//! itself. `cd-server` supplies the `sqlx`-backed implementation; an
//! in-memory one lives here for the orchestrator's own tests, the same
//! split `cd_common::routing::RoutingPublisher` uses.

use async_trait::async_trait;
use cd_common::ids::{ContainerId, DeploymentId, ProjectRef};
use cd_common::model::{
    Container, Deployment, DeploymentStatus, Environment, PhaseTransition, StrategyState,
};
use cd_common::Result;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn get_deployment(&self, id: DeploymentId) -> Result<Deployment>;
    async fn put_deployment(&self, deployment: Deployment) -> Result<()>;

    /// Optimistic transition guarded by the row's current status (spec §5:
    /// `UPDATE ... WHERE status = $expected`). Returns whether it applied.
    async fn transition_status(
        &self,
        id: DeploymentId,
        expected: DeploymentStatus,
        next: DeploymentStatus,
    ) -> Result<bool>;

    async fn find_active_deployment(
        &self,
        project_ref: ProjectRef,
        environment: Environment,
        branch: &str,
    ) -> Result<Option<Deployment>>;

    /// Preview deployments with `status == Active` whose TTL has elapsed
    /// (spec §4.4.2's TTL reaper supplement).
    async fn find_expired_previews(&self, now: DateTime<Utc>) -> Result<Vec<Deployment>>;

    async fn get_strategy_state(&self, deployment_ref: DeploymentId) -> Result<Option<StrategyState>>;
    async fn put_strategy_state(&self, state: StrategyState) -> Result<()>;

    async fn record_phase_transition(&self, transition: PhaseTransition) -> Result<()>;

    async fn list_containers(&self, deployment_ref: DeploymentId) -> Result<Vec<Container>>;
    async fn get_container(&self, id: ContainerId) -> Result<Option<Container>>;
    async fn put_container(&self, container: Container) -> Result<()>;
    async fn delete_container(&self, id: ContainerId) -> Result<()>;
}

/// Used by this crate's own tests, and by `cd-server`'s tests that want to
/// exercise the bus-consumer wiring without Postgres.
#[derive(Default)]
pub struct InMemoryStore {
    inner: tokio::sync::RwLock<InMemoryTables>,
}

#[derive(Default)]
struct InMemoryTables {
    deployments: std::collections::HashMap<DeploymentId, Deployment>,
    strategy_states: std::collections::HashMap<DeploymentId, StrategyState>,
    transitions: Vec<PhaseTransition>,
    containers: std::collections::HashMap<ContainerId, Container>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn transitions(&self) -> Vec<PhaseTransition> {
        self.inner.read().await.transitions.clone()
    }
}

#[async_trait]
impl DeploymentStore for InMemoryStore {
    async fn get_deployment(&self, id: DeploymentId) -> Result<Deployment> {
        self.inner
            .read()
            .await
            .deployments
            .get(&id)
            .cloned()
            .ok_or_else(|| cd_common::ErrorKind::NotFound.into())
    }

    async fn put_deployment(&self, deployment: Deployment) -> Result<()> {
        self.inner
            .write()
            .await
            .deployments
            .insert(deployment.id, deployment);
        Ok(())
    }

    async fn transition_status(
        &self,
        id: DeploymentId,
        expected: DeploymentStatus,
        next: DeploymentStatus,
    ) -> Result<bool> {
        let mut tables = self.inner.write().await;
        match tables.deployments.get_mut(&id) {
            Some(deployment) if deployment.status == expected => {
                deployment.status = next;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(cd_common::ErrorKind::NotFound.into()),
        }
    }

    async fn find_active_deployment(
        &self,
        project_ref: ProjectRef,
        environment: Environment,
        branch: &str,
    ) -> Result<Option<Deployment>> {
        Ok(self
            .inner
            .read()
            .await
            .deployments
            .values()
            .find(|d| {
                d.project_ref == project_ref
                    && d.environment == environment
                    && d.branch == branch
                    && d.status == DeploymentStatus::Active
            })
            .cloned())
    }

    async fn find_expired_previews(&self, now: DateTime<Utc>) -> Result<Vec<Deployment>> {
        Ok(self
            .inner
            .read()
            .await
            .deployments
            .values()
            .filter(|d| d.status == DeploymentStatus::Active && d.is_expired_preview(now))
            .cloned()
            .collect())
    }

    async fn get_strategy_state(&self, deployment_ref: DeploymentId) -> Result<Option<StrategyState>> {
        Ok(self
            .inner
            .read()
            .await
            .strategy_states
            .get(&deployment_ref)
            .cloned())
    }

    async fn put_strategy_state(&self, state: StrategyState) -> Result<()> {
        self.inner
            .write()
            .await
            .strategy_states
            .insert(state.deployment_ref, state);
        Ok(())
    }

    async fn record_phase_transition(&self, transition: PhaseTransition) -> Result<()> {
        self.inner.write().await.transitions.push(transition);
        Ok(())
    }

    async fn list_containers(&self, deployment_ref: DeploymentId) -> Result<Vec<Container>> {
        Ok(self
            .inner
            .read()
            .await
            .containers
            .values()
            .filter(|c| c.deployment_ref == deployment_ref)
            .cloned()
            .collect())
    }

    async fn get_container(&self, id: ContainerId) -> Result<Option<Container>> {
        Ok(self.inner.read().await.containers.get(&id).cloned())
    }

    async fn put_container(&self, container: Container) -> Result<()> {
        self.inner
            .write()
            .await
            .containers
            .insert(container.id, container);
        Ok(())
    }

    async fn delete_container(&self, id: ContainerId) -> Result<()> {
        self.inner.write().await.containers.remove(&id);
        Ok(())
    }
}
