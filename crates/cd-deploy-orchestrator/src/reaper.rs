//! Preview-environment TTL reaper (spec §4.4.2 supplement, SPEC_FULL.md §2):
//! a periodic task transitioning expired preview deployments to
//! `terminated`, tearing down their containers and routing the same way
//! `cleanup.rs` does. Grounded on the teacher's periodic-task / worker-queue
//! pairing -- this is the cron-like producer feeding the same teardown path.

use std::sync::Arc;
use std::time::Duration;

use cd_common::model::{Container, ContainerStatus, DeploymentStatus};
use cd_common::routing::RoutingPublisher;
use tracing::{error, info};

use crate::containers::ContainerRuntime;
use crate::store::DeploymentStore;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Reaper {
    store: Arc<dyn DeploymentStore>,
    runtime: Arc<dyn ContainerRuntime>,
    routing: Arc<dyn RoutingPublisher>,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        runtime: Arc<dyn ContainerRuntime>,
        routing: Arc<dyn RoutingPublisher>,
    ) -> Self {
        Self {
            store,
            runtime,
            routing,
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.sweep_once(chrono::Utc::now()).await;
            }
        })
    }

    /// Runs one sweep. Public so tests and a manual admin trigger can call
    /// it without waiting on the interval.
    pub async fn sweep_once(&self, now: chrono::DateTime<chrono::Utc>) {
        let expired = match self.store.find_expired_previews(now).await {
            Ok(list) => list,
            Err(e) => {
                error!(error = %e, "reaper: failed to query expired previews");
                return;
            }
        };

        for deployment in expired {
            info!(deployment_id = %deployment.id, "reaper: terminating expired preview");

            if let Err(e) = self.routing.clear(deployment.id).await {
                error!(deployment_id = %deployment.id, error = %e, "reaper: failed to clear routing");
            }

            match self.store.list_containers(deployment.id).await {
                Ok(containers) => {
                    for container in containers {
                        self.stop_one(&container).await;
                    }
                }
                Err(e) => error!(deployment_id = %deployment.id, error = %e, "reaper: failed to list containers"),
            }

            let applied = self
                .store
                .transition_status(deployment.id, DeploymentStatus::Active, DeploymentStatus::Terminated)
                .await;
            if let Err(e) = applied {
                error!(deployment_id = %deployment.id, error = %e, "reaper: failed to mark terminated");
            }
        }
    }

    async fn stop_one(&self, container: &Container) {
        if let Err(e) = self.runtime.stop_and_remove(&container.runtime_id).await {
            error!(container_id = %container.id, error = %e, "reaper: failed to stop container");
        }
        if let Err(e) = self.store.delete_container(container.id).await {
            error!(container_id = %container.id, error = %e, "reaper: failed to delete container row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::FakeRuntime;
    use crate::store::InMemoryStore;
    use cd_common::ids::{BuildId, ContainerId, DeploymentId, ProjectRef};
    use cd_common::model::{Deployment, Environment, Strategy};
    use cd_common::routing::InMemoryRoutingPublisher;
    use chrono::Duration as ChronoDuration;

    fn preview_deployment(id: DeploymentId, expires_at: chrono::DateTime<chrono::Utc>) -> Deployment {
        Deployment {
            id,
            project_ref: ProjectRef::new(),
            build_ref: BuildId::new(),
            environment: Environment::Preview,
            strategy: Strategy::BlueGreen,
            status: DeploymentStatus::Active,
            domain: None,
            subdomain: None,
            replicas: 1,
            traffic_pct: 100,
            retry_count: 0,
            retry_errors: Vec::new(),
            error: None,
            branch: "feature/x".into(),
            preview_expires_at: Some(expires_at),
        }
    }

    #[tokio::test]
    async fn terminates_expired_previews_and_tears_down_their_containers() {
        let store: Arc<dyn DeploymentStore> = Arc::new(InMemoryStore::new());
        let runtime = FakeRuntime::shared();
        let routing: Arc<dyn RoutingPublisher> = Arc::new(InMemoryRoutingPublisher::new());

        let now = chrono::Utc::now();
        let deployment_id = DeploymentId::new();
        store
            .put_deployment(preview_deployment(deployment_id, now - ChronoDuration::minutes(1)))
            .await
            .unwrap();

        let container_id = ContainerId::new();
        store
            .put_container(Container {
                id: container_id,
                deployment_ref: deployment_id,
                runtime_id: "docker-fake-1".into(),
                group: "green".into(),
                status: ContainerStatus::Running,
                health_status: None,
                replica_index: 0,
                is_active: true,
                is_primary: true,
                internal_ip: None,
                port: 8080,
            })
            .await
            .unwrap();

        let reaper = Reaper::new(store.clone(), runtime, routing);
        reaper.sweep_once(now).await;

        let deployment = store.get_deployment(deployment_id).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Terminated);
        assert!(store.list_containers(deployment_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn leaves_unexpired_previews_alone() {
        let store: Arc<dyn DeploymentStore> = Arc::new(InMemoryStore::new());
        let runtime = FakeRuntime::shared();
        let routing: Arc<dyn RoutingPublisher> = Arc::new(InMemoryRoutingPublisher::new());

        let now = chrono::Utc::now();
        let deployment_id = DeploymentId::new();
        store
            .put_deployment(preview_deployment(deployment_id, now + ChronoDuration::hours(1)))
            .await
            .unwrap();

        let reaper = Reaper::new(store.clone(), runtime, routing);
        reaper.sweep_once(now).await;

        let deployment = store.get_deployment(deployment_id).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Active);
    }
}
