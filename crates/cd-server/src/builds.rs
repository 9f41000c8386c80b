//! Owns everything `cd_build_worker::BuildWorker::process` does not: the
//! `Build` row's lifecycle, idempotency on redelivery, and constructing the
//! `deploy.triggered` message when a build asked to be deployed.

use cd_build_worker::{BuildOutcome, BuildTriggered, BuildWorker};
use cd_common::model::BuildStatus;
use cd_common::{Error, ErrorKind, Result};
use cd_qrl::Limits;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::projects;

/// Platform-wide admission ceiling until a per-tenant plan store exists
/// (open question, recorded in DESIGN.md: spec §4.1 leaves plan resolution
/// outside QRL's scope and the distilled spec never introduces a plans
/// table).
pub fn default_limits() -> Limits {
    Limits {
        max_concurrent: 20,
        rate_per_minute: 60,
        monthly_allotment: 1000,
    }
}

fn store_err<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
    Error::source(ErrorKind::StoreUnavailable, err)
}

/// `Some(status)` if this build_id was already seen and has reached a
/// terminal status -- redelivery is then a no-op (spec §8 round-trip
/// property).
async fn already_terminal(pool: &PgPool, build: &BuildTriggered) -> Result<Option<BuildStatus>> {
    let row = sqlx::query("SELECT status FROM builds WHERE id = $1")
        .bind(build.build_id)
        .fetch_optional(pool)
        .await
        .map_err(store_err)?;
    let Some(row) = row else { return Ok(None) };
    let status: BuildStatus = row.try_get("status").map_err(store_err)?;
    Ok(status.is_terminal().then_some(status))
}

async fn upsert_queued(pool: &PgPool, build: &BuildTriggered) -> Result<()> {
    sqlx::query(
        "INSERT INTO builds (id, project_ref, commit, branch, status, started_at, retry_count)
         VALUES ($1,$2,$3,$4,'queued',$5,0)
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(build.build_id)
    .bind(build.project_ref)
    .bind(&build.commit)
    .bind(&build.branch)
    .bind(Utc::now())
    .execute(pool)
    .await
    .map_err(store_err)?;
    Ok(())
}

async fn persist_outcome(pool: &PgPool, outcome: &BuildOutcome) -> Result<()> {
    sqlx::query(
        "UPDATE builds SET status = $1, image_tags = $2, error = $3, completed_at = $4
         WHERE id = $5",
    )
    .bind(outcome.status)
    .bind(&outcome.image_tags)
    .bind(&outcome.error)
    .bind(Utc::now())
    .bind(outcome.build_id)
    .execute(pool)
    .await
    .map_err(store_err)?;
    Ok(())
}

/// The result of running a build, before its terminal status has been
/// persisted. Spec §4.3 step 8 enqueues `deploy.triggered` *before*
/// transitioning the build to `completed` -- if the build row went terminal
/// first and the enqueue then failed and got requeued, `already_terminal`
/// would swallow the redelivery and the deploy would never happen. Keeping
/// `outcome` un-persisted until the caller confirms the enqueue (or confirms
/// none is needed) preserves that ordering.
pub struct BuildProcessed {
    pub outcome: BuildOutcome,
    pub deploy_trigger: Option<cd_deploy_orchestrator::DeployTriggered>,
}

/// Processes one `build.triggered` delivery end to end, except for
/// persisting the terminal outcome -- the caller (the bus consumer loop)
/// must call [`persist_build_outcome`] only once it has durably enqueued
/// `deploy_trigger` (or confirmed none is needed), then ack.
pub async fn handle_build_triggered(
    pool: &PgPool,
    worker: &BuildWorker,
    msg: BuildTriggered,
) -> Result<Option<BuildProcessed>> {
    if let Some(status) = already_terminal(pool, &msg).await? {
        info!(build_id = %msg.build_id, ?status, "build already terminal, skipping redelivered message");
        return Ok(None);
    }

    upsert_queued(pool, &msg).await?;

    let project = projects::get_project(pool, msg.project_ref).await?;
    let deployment_id = msg.deployment_id;
    let deploy = msg.deploy;
    let deployment_request = msg.deployment.clone();
    let branch = msg.branch.clone();
    let commit = msg.commit.clone();

    let outcome = worker
        .process(project.tenant_ref, default_limits(), msg)
        .await;

    let deploy_trigger = 'trigger: {
        if !outcome.should_enqueue_deploy || !deploy {
            break 'trigger None;
        }
        let (Some(deployment_id), Some(request)) = (deployment_id, deployment_request) else {
            break 'trigger None;
        };

        Some(cd_deploy_orchestrator::DeployTriggered {
            deployment_id,
            build_id: outcome.build_id,
            project_ref: project.project_ref,
            project: cd_deploy_orchestrator::message::ProjectInfo {
                slug: project.slug,
                name: project.name,
            },
            build: cd_deploy_orchestrator::message::BuildInfo {
                image_tags: outcome.image_tags.clone(),
                branch,
                commit,
                metadata: serde_json::Value::Null,
            },
            deployment: cd_deploy_orchestrator::message::DeploymentSpec {
                environment: request.environment,
                strategy: request.strategy,
                domain: request.domain,
                subdomain: request.subdomain,
                replicas: request.replicas,
            },
        })
    };

    Ok(Some(BuildProcessed { outcome, deploy_trigger }))
}

/// Persists the build's terminal status. Must only be called after the
/// caller has durably enqueued `deploy.triggered` (when one was produced),
/// per spec §4.3 step 8's ordering.
pub async fn persist_build_outcome(pool: &PgPool, outcome: &BuildOutcome) -> Result<()> {
    persist_outcome(pool, outcome).await
}
