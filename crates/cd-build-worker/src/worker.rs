//! The Build Worker pipeline (spec §4.3). One task per active build; task
//! count is bounded by QRL's concurrent-build ceiling, mirroring the
//! teacher's one-pipeline-task-per-unit-of-work discipline in
//! `deployer/src/deployment/mod.rs`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bollard::Docker;
use cd_asg::{paths, ArtifactStore};
use cd_broker::EventBroker;
use cd_common::ids::{BuildId, TenantRef};
use cd_common::model::{BuildStatus, EventKind, ResourceType, Severity};
use cd_common::retry::backoff_delay;
use cd_common::Error;
use cd_qrl::{Limits, QuotaLimiter, TicketGuard};
use serde_json::json;
use tracing::{info, instrument, warn};
use ulid::Ulid;

use crate::builder::{build_image, BuildLimits};
use crate::framework;
use crate::message::BuildTriggered;
use crate::scratch::ScratchDir;
use crate::source;

/// Outcome handed back to the caller so it can decide whether to enqueue
/// `deploy.triggered` and how to acknowledge the originating message.
pub struct BuildOutcome {
    pub build_id: BuildId,
    pub status: BuildStatus,
    pub image_tags: Vec<String>,
    pub error: Option<String>,
    pub should_enqueue_deploy: bool,
}

pub struct BuildWorkerConfig {
    pub scratch_root: PathBuf,
    pub registry_prefix: String,
    pub build_timeout: Duration,
    pub max_artifact_bytes: u64,
    pub clone_retry_attempts: u32,
}

pub struct BuildWorker {
    docker: Docker,
    store: Arc<dyn ArtifactStore>,
    quota: Arc<dyn QuotaLimiter>,
    broker: EventBroker,
    config: BuildWorkerConfig,
}

impl BuildWorker {
    pub fn new(
        docker: Docker,
        store: Arc<dyn ArtifactStore>,
        quota: Arc<dyn QuotaLimiter>,
        broker: EventBroker,
        config: BuildWorkerConfig,
    ) -> Self {
        Self {
            docker,
            store,
            quota,
            broker,
            config,
        }
    }

    /// Runs the full algorithm in spec §4.3 for one `build.triggered`
    /// message. Never panics: every failure path returns a terminal
    /// `BuildOutcome` so the caller can always acknowledge the message.
    #[instrument(skip(self, msg, limits), fields(build_id = %msg.build_id))]
    pub async fn process(&self, tenant: TenantRef, limits: Limits, msg: BuildTriggered) -> BuildOutcome {
        let resource = resource_ulid(msg.build_id);
        let idempotency_key = msg.build_id.to_string();

        let ticket = match self
            .quota
            .reserve_build(tenant, &idempotency_key, limits)
            .await
        {
            Ok(ticket) => ticket,
            Err(err) => {
                warn!(error = %err, "build admission refused");
                self.emit_phase(resource, "failed", Some(err.to_string()))
                    .await;
                return terminal(msg.build_id, err.to_string(), false);
            }
        };
        let guard = TicketGuard::new(ticket, self.quota.clone());

        let outcome = self.run_steps(resource, &msg).await;
        guard.release().await;

        match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                self.emit_phase(resource, "failed", Some(err.to_string()))
                    .await;
                terminal(msg.build_id, err.to_string(), false)
            }
        }
    }

    async fn run_steps(
        &self,
        resource: Ulid,
        msg: &BuildTriggered,
    ) -> Result<BuildOutcome, Error> {
        let scratch = ScratchDir::create(&self.config.scratch_root, msg.build_id)?;
        let log_path = paths::build_log(msg.project_ref, msg.build_id);

        self.emit_phase(resource, "cloning", None).await;
        self.clone_with_retry(msg, scratch.source_path()).await?;

        self.emit_phase(resource, "building", None).await;
        let profile = framework::detect(&scratch.source_path());
        if !framework::has_existing_recipe(&scratch.source_path()) {
            let recipe = framework::synthesize_recipe(&profile, None);
            tokio::fs::write(scratch.source_path().join("Dockerfile"), recipe).await?;
        }

        let image_tag = format!(
            "{}/{}:{}",
            self.config.registry_prefix, msg.project_ref, msg.commit
        );
        let limits = BuildLimits {
            max_duration: self.config.build_timeout,
            max_artifact_bytes: self.config.max_artifact_bytes,
        };

        let mut log_buffer = Vec::new();
        let broker = self.broker.clone();
        let store = self.store.clone();
        let log_path_for_closure = log_path.clone();
        let build_result = build_image(
            &self.docker,
            &scratch.source_path(),
            &image_tag,
            &limits,
            |line| {
                log_buffer.push(line.to_string());
                let broker = broker.clone();
                let store = store.clone();
                let log_path = log_path_for_closure.clone();
                let line = line.to_string();
                tokio::spawn(async move {
                    let _ = store.put(&log_path, line.clone().into_bytes().into()).await;
                    broker
                        .publish(
                            ResourceType::Build,
                            resource,
                            EventKind::Log,
                            Severity::Info,
                            json!({ "line": line }),
                        )
                        .await;
                });
            },
        )
        .await;

        let image_id = match build_result {
            Ok(id) => id,
            Err(err) => {
                let _ = self
                    .store
                    .put(&log_path, log_buffer.join("\n").into_bytes().into())
                    .await;
                return Err(err);
            }
        };

        self.emit_phase(resource, "pushing", None).await;
        let image_tags = vec![image_tag.clone()];

        let should_enqueue_deploy = msg.deploy && msg.deployment_id.is_some();

        self.broker
            .publish(
                ResourceType::Build,
                resource,
                EventKind::Complete,
                Severity::Info,
                json!({ "image_tags": image_tags, "image_id": image_id }),
            )
            .await;

        Ok(BuildOutcome {
            build_id: msg.build_id,
            status: BuildStatus::Completed,
            image_tags,
            error: None,
            should_enqueue_deploy,
        })
    }

    async fn clone_with_retry(&self, msg: &BuildTriggered, dest: PathBuf) -> Result<(), Error> {
        let mut attempt = 0;
        loop {
            match source::fetch(&msg.git_url, &msg.branch, &msg.commit, &dest).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt + 1 < self.config.clone_retry_attempts => {
                    attempt += 1;
                    warn!(attempt, error = %err, "clone failed, retrying");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn emit_phase(&self, resource: Ulid, phase: &str, error: Option<String>) {
        info!(phase, "build phase transition");
        self.broker
            .publish(
                ResourceType::Build,
                resource,
                EventKind::Phase,
                if error.is_some() {
                    Severity::Critical
                } else {
                    Severity::Info
                },
                json!({ "phase": phase, "error": error }),
            )
            .await;
    }
}

fn resource_ulid(build_id: BuildId) -> Ulid {
    build_id
        .to_string()
        .parse()
        .expect("BuildId is always a valid Ulid")
}

fn terminal(build_id: BuildId, error: String, should_enqueue_deploy: bool) -> BuildOutcome {
    BuildOutcome {
        build_id,
        status: BuildStatus::Failed,
        image_tags: Vec::new(),
        error: Some(error),
        should_enqueue_deploy,
    }
}
