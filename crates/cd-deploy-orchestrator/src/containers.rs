//! Container lifecycle, abstracted behind [`ContainerRuntime`] the same way
//! `cd_common::routing::RoutingPublisher` abstracts proxy configuration:
//! tests exercise the strategy/state-machine logic against a fake, never a
//! real docker daemon. Grounded on `deployer/src/project/state/creating.rs`'s
//! inspect-or-create pattern and `deployer/src/project/service/state/l_destroying.rs`'s
//! stop-then-remove.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use cd_common::ids::ContainerId;
use cd_common::{Error, ErrorKind};
use tokio::sync::Mutex;

#[derive(Clone, Debug)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub port: u16,
    pub env: Vec<(String, String)>,
    pub network: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeState {
    Running,
    Exited,
    Missing,
}

/// The grace period given to a container between the stop signal and
/// forced removal (spec §4.4.1 "completed": "stop signal, grace period,
/// remove").
pub const STOP_GRACE_SECONDS: i64 = 10;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn start(&self, spec: &ContainerSpec) -> Result<(String, Option<String>), Error>;
    async fn state(&self, container_id: &str) -> Result<RuntimeState, Error>;
    async fn stop_and_remove(&self, container_id: &str) -> Result<(), Error>;
}

pub struct BollardRuntime {
    docker: Docker,
}

impl BollardRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

fn backend_err<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
    Error::source(ErrorKind::StoreUnavailable, err)
}

#[async_trait]
impl ContainerRuntime for BollardRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<(String, Option<String>), Error> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            exposed_ports: Some(HashMap::from([(
                format!("{}/tcp", spec.port),
                HashMap::new(),
            )])),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(backend_err)?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(backend_err)?;

        let inspected = self
            .docker
            .inspect_container(&created.id, None)
            .await
            .map_err(backend_err)?;

        let internal_ip = inspected
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|networks| networks.get(&spec.network).cloned())
            .and_then(|network| network.ip_address)
            .filter(|ip| !ip.is_empty());

        Ok((created.id, internal_ip))
    }

    async fn state(&self, container_id: &str) -> Result<RuntimeState, Error> {
        match self.docker.inspect_container(container_id, None).await {
            Ok(info) => {
                let running = info
                    .state
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                Ok(if running {
                    RuntimeState::Running
                } else {
                    RuntimeState::Exited
                })
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Ok(RuntimeState::Missing)
            }
            Err(e) => Err(backend_err(e)),
        }
    }

    async fn stop_and_remove(&self, container_id: &str) -> Result<(), Error> {
        match self
            .docker
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: STOP_GRACE_SECONDS,
                }),
            )
            .await
        {
            Ok(()) | Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {}
            Err(e) => return Err(backend_err(e)),
        }

        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) | Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(backend_err(e)),
        }
    }
}

/// An in-memory fake used throughout the orchestrator's own tests so the
/// state machine's logic is exercised without a docker daemon.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, RuntimeState>>,
    pub fail_start: std::sync::atomic::AtomicBool,
}

impl FakeRuntime {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn mark(&self, container_id: &str, state: RuntimeState) {
        self.containers
            .lock()
            .await
            .insert(container_id.to_string(), state);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<(String, Option<String>), Error> {
        if self.fail_start.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::from_kind(ErrorKind::StoreUnavailable));
        }
        let id = ContainerId::new().to_string();
        self.containers
            .lock()
            .await
            .insert(id.clone(), RuntimeState::Running);
        Ok((id, Some(format!("10.0.0.{}", spec.port % 250))))
    }

    async fn state(&self, container_id: &str) -> Result<RuntimeState, Error> {
        Ok(self
            .containers
            .lock()
            .await
            .get(container_id)
            .copied()
            .unwrap_or(RuntimeState::Missing))
    }

    async fn stop_and_remove(&self, container_id: &str) -> Result<(), Error> {
        self.containers.lock().await.remove(container_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_runtime_reports_running_after_start() {
        let runtime = FakeRuntime::shared();
        let spec = ContainerSpec {
            name: "web-1".into(),
            image: "img:sha".into(),
            port: 8080,
            env: vec![],
            network: "cd-net".into(),
        };
        let (id, ip) = runtime.start(&spec).await.unwrap();
        assert_eq!(runtime.state(&id).await.unwrap(), RuntimeState::Running);
        assert!(ip.is_some());
    }

    #[tokio::test]
    async fn stop_and_remove_makes_container_missing() {
        let runtime = FakeRuntime::shared();
        let spec = ContainerSpec {
            name: "web-1".into(),
            image: "img:sha".into(),
            port: 8080,
            env: vec![],
            network: "cd-net".into(),
        };
        let (id, _) = runtime.start(&spec).await.unwrap();
        runtime.stop_and_remove(&id).await.unwrap();
        assert_eq!(runtime.state(&id).await.unwrap(), RuntimeState::Missing);
    }
}
