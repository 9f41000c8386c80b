pub mod cleanup;
pub mod containers;
pub mod health;
pub mod message;
pub mod metrics;
pub mod orchestrator;
pub mod reaper;
pub mod retry;
pub mod store;
pub mod strategy;

pub use cleanup::Cleanup;
pub use containers::{BollardRuntime, ContainerRuntime, ContainerSpec, FakeRuntime};
pub use health::{default_policy, HealthPolicy, HealthProbe, HttpHealthProbe};
pub use message::{DeployTriggered, ProjectCleanup};
pub use metrics::{MetricsSource, ZeroMetricsSource};
pub use orchestrator::{DeployOrchestrator, DeployOutcome, OrchestratorConfig};
pub use reaper::Reaper;
pub use store::{DeploymentStore, InMemoryStore};
