//! `project.cleanup` teardown (spec §4.4.3): idempotent and best-effort.
//! Errors are logged, never propagated -- the message always acks.

use std::str::FromStr;
use std::sync::Arc;

use cd_common::ids::ContainerId;
use cd_common::routing::RoutingPublisher;
use tracing::warn;

use crate::containers::ContainerRuntime;
use crate::message::ProjectCleanup;
use crate::store::DeploymentStore;

pub struct Cleanup {
    store: Arc<dyn DeploymentStore>,
    runtime: Arc<dyn ContainerRuntime>,
    routing: Arc<dyn RoutingPublisher>,
}

impl Cleanup {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        runtime: Arc<dyn ContainerRuntime>,
        routing: Arc<dyn RoutingPublisher>,
    ) -> Self {
        Self {
            store,
            runtime,
            routing,
        }
    }

    /// Processes one `project.cleanup` message. Never returns an error:
    /// a container that is already gone, or whose row no longer exists, is
    /// treated as already cleaned up.
    pub async fn run(&self, msg: &ProjectCleanup) {
        for entry in &msg.containers {
            self.teardown_one(&entry.id).await;
        }
    }

    async fn teardown_one(&self, raw_container_id: &str) {
        let Ok(container_id) = ContainerId::from_str(raw_container_id) else {
            warn!(container_id = raw_container_id, "cleanup: unparseable container id, skipping");
            return;
        };

        let container = match self.store.get_container(container_id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(%container_id, error = %e, "cleanup: failed to look up container row");
                return;
            }
        };

        let Some(container) = container else {
            return; // already torn down: idempotent no-op
        };

        if let Err(e) = self.routing.clear(container.deployment_ref).await {
            warn!(%container_id, error = %e, "cleanup: failed to clear routing, continuing");
        }

        if let Err(e) = self.runtime.stop_and_remove(&container.runtime_id).await {
            warn!(%container_id, error = %e, "cleanup: failed to stop/remove container");
        }

        if let Err(e) = self.store.delete_container(container_id).await {
            warn!(%container_id, error = %e, "cleanup: failed to delete container row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::FakeRuntime;
    use crate::message::CleanupContainer;
    use crate::store::InMemoryStore;
    use cd_common::ids::DeploymentId;
    use cd_common::model::{Container, ContainerStatus};
    use cd_common::routing::InMemoryRoutingPublisher;

    #[tokio::test]
    async fn tears_down_a_known_container_and_clears_its_routing() {
        let store: Arc<dyn DeploymentStore> = Arc::new(InMemoryStore::new());
        let runtime = FakeRuntime::shared();
        let routing: Arc<dyn RoutingPublisher> = Arc::new(InMemoryRoutingPublisher::new());

        let deployment_ref = DeploymentId::new();
        let spec = crate::containers::ContainerSpec {
            name: "web-1".into(),
            image: "img:sha".into(),
            port: 8080,
            env: vec![],
            network: "cd-net".into(),
        };
        let (container_id_str, _) = runtime.start(&spec).await.unwrap();
        let container_id = ContainerId::from_str(&container_id_str).unwrap_or_else(|_| ContainerId::new());

        routing
            .publish(
                deployment_ref,
                vec![cd_common::model::RoutingRule {
                    deployment_ref,
                    group: "green".into(),
                    traffic_pct: 100,
                    container_ids: vec![container_id],
                    is_active: true,
                }],
            )
            .await
            .unwrap();

        store
            .put_container(Container {
                id: container_id,
                deployment_ref,
                runtime_id: container_id_str.clone(),
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

        let cleanup = Cleanup::new(store.clone(), runtime.clone(), routing.clone());
        let msg = ProjectCleanup {
            project_ref: cd_common::ids::ProjectRef::new(),
            containers: vec![CleanupContainer {
                id: container_id.to_string(),
                name: "web-1".into(),
            }],
        };
        cleanup.run(&msg).await;

        assert!(routing.current(deployment_ref).await.unwrap().is_empty());
        assert!(store.get_container(container_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn running_cleanup_twice_is_a_no_op_the_second_time() {
        let store: Arc<dyn DeploymentStore> = Arc::new(InMemoryStore::new());
        let runtime = FakeRuntime::shared();
        let routing: Arc<dyn RoutingPublisher> = Arc::new(InMemoryRoutingPublisher::new());
        let cleanup = Cleanup::new(store, runtime, routing);

        let msg = ProjectCleanup {
            project_ref: cd_common::ids::ProjectRef::new(),
            containers: vec![CleanupContainer {
                id: ContainerId::new().to_string(),
                name: "ghost".into(),
            }],
        };

        cleanup.run(&msg).await;
        cleanup.run(&msg).await;
    }
}
