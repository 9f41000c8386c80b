//! The `sqlx`-backed `DeploymentStore` (spec §3, §5). Manual row mapping
//! via `Row::try_get`, the same style as `gateway/src/deployer/dal.rs`'s
//! `Dal` impl -- no compile-time-checked `query!` macro, since that needs a
//! live database at build time.

use async_trait::async_trait;
use cd_common::ids::{ContainerId, DeploymentId, ProjectRef};
use cd_common::model::{
    Container, Deployment, DeploymentStatus, Environment, PhaseTransition, StrategyState,
};
use cd_common::{Error, ErrorKind, Result};
use cd_deploy_orchestrator::store::DeploymentStore;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

#[derive(Clone)]
pub struct PgDeploymentStore {
    pool: PgPool,
}

impl PgDeploymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn store_err<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
    Error::source(ErrorKind::StoreUnavailable, err)
}

pub(crate) fn deployment_from_row(row: &sqlx::postgres::PgRow) -> Result<Deployment> {
    Ok(Deployment {
        id: row.try_get("id").map_err(store_err)?,
        project_ref: row.try_get("project_ref").map_err(store_err)?,
        build_ref: row.try_get("build_ref").map_err(store_err)?,
        environment: row.try_get("environment").map_err(store_err)?,
        strategy: row.try_get("strategy").map_err(store_err)?,
        status: row.try_get("status").map_err(store_err)?,
        domain: row.try_get("domain").map_err(store_err)?,
        subdomain: row.try_get("subdomain").map_err(store_err)?,
        replicas: row.try_get::<i32, _>("replicas").map_err(store_err)? as u32,
        traffic_pct: row.try_get::<i16, _>("traffic_pct").map_err(store_err)? as u8,
        retry_count: row.try_get::<i32, _>("retry_count").map_err(store_err)? as u32,
        retry_errors: row.try_get("retry_errors").map_err(store_err)?,
        error: row.try_get("error").map_err(store_err)?,
        branch: row.try_get("branch").map_err(store_err)?,
        preview_expires_at: row.try_get("preview_expires_at").map_err(store_err)?,
    })
}

fn container_from_row(row: &sqlx::postgres::PgRow) -> Result<Container> {
    Ok(Container {
        id: row.try_get("id").map_err(store_err)?,
        deployment_ref: row.try_get("deployment_ref").map_err(store_err)?,
        runtime_id: row.try_get("runtime_id").map_err(store_err)?,
        group: row.try_get("group_name").map_err(store_err)?,
        status: row.try_get("status").map_err(store_err)?,
        health_status: row.try_get("health_status").map_err(store_err)?,
        replica_index: row.try_get::<i32, _>("replica_index").map_err(store_err)? as u32,
        is_active: row.try_get("is_active").map_err(store_err)?,
        is_primary: row.try_get("is_primary").map_err(store_err)?,
        internal_ip: row.try_get("internal_ip").map_err(store_err)?,
        port: row.try_get::<i32, _>("port").map_err(store_err)? as u16,
    })
}

#[async_trait]
impl DeploymentStore for PgDeploymentStore {
    async fn get_deployment(&self, id: DeploymentId) -> Result<Deployment> {
        let row = sqlx::query("SELECT * FROM deployments WHERE id = $1 AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?
            .ok_or(ErrorKind::NotFound)?;
        deployment_from_row(&row)
    }

    async fn put_deployment(&self, deployment: Deployment) -> Result<()> {
        sqlx::query(
            "INSERT INTO deployments (
                id, project_ref, build_ref, environment, strategy, status, domain, subdomain,
                replicas, traffic_pct, retry_count, retry_errors, error, branch, preview_expires_at
             ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)
             ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status, domain = EXCLUDED.domain, subdomain = EXCLUDED.subdomain,
                replicas = EXCLUDED.replicas, traffic_pct = EXCLUDED.traffic_pct,
                retry_count = EXCLUDED.retry_count, retry_errors = EXCLUDED.retry_errors,
                error = EXCLUDED.error, preview_expires_at = EXCLUDED.preview_expires_at",
        )
        .bind(deployment.id)
        .bind(deployment.project_ref)
        .bind(deployment.build_ref)
        .bind(deployment.environment)
        .bind(deployment.strategy)
        .bind(deployment.status)
        .bind(&deployment.domain)
        .bind(&deployment.subdomain)
        .bind(deployment.replicas as i32)
        .bind(deployment.traffic_pct as i16)
        .bind(deployment.retry_count as i32)
        .bind(&deployment.retry_errors)
        .bind(&deployment.error)
        .bind(deployment.branch)
        .bind(deployment.preview_expires_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn transition_status(
        &self,
        id: DeploymentId,
        expected: DeploymentStatus,
        next: DeploymentStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE deployments SET status = $1 WHERE id = $2 AND status = $3 AND deleted_at IS NULL",
        )
        .bind(next)
        .bind(id)
        .bind(expected)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_active_deployment(
        &self,
        project_ref: ProjectRef,
        environment: Environment,
        branch: &str,
    ) -> Result<Option<Deployment>> {
        let row = sqlx::query(
            "SELECT * FROM deployments
             WHERE project_ref = $1 AND environment = $2 AND branch = $3
               AND status = 'active' AND deleted_at IS NULL",
        )
        .bind(project_ref)
        .bind(environment)
        .bind(branch)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(deployment_from_row).transpose()
    }

    async fn find_expired_previews(&self, now: DateTime<Utc>) -> Result<Vec<Deployment>> {
        let rows = sqlx::query(
            "SELECT * FROM deployments
             WHERE status = 'active' AND environment = 'preview'
               AND preview_expires_at IS NOT NULL AND preview_expires_at <= $1
               AND deleted_at IS NULL",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(deployment_from_row).collect()
    }

    async fn get_strategy_state(&self, deployment_ref: DeploymentId) -> Result<Option<StrategyState>> {
        let row = sqlx::query("SELECT * FROM strategy_state WHERE deployment_ref = $1")
            .bind(deployment_ref)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(StrategyState {
            deployment_ref: row.try_get("deployment_ref").map_err(store_err)?,
            phase: row.try_get("phase").map_err(store_err)?,
            active_group: row.try_get("active_group").map_err(store_err)?,
            standby_group: row.try_get("standby_group").map_err(store_err)?,
            batches_completed: row.try_get::<i32, _>("batches_completed").map_err(store_err)? as u32,
            total_batches: row.try_get::<i32, _>("total_batches").map_err(store_err)? as u32,
            canary_traffic_pct: row.try_get::<i16, _>("canary_traffic_pct").map_err(store_err)? as u8,
            canary_passed: row.try_get("canary_passed").map_err(store_err)?,
        }))
    }

    async fn put_strategy_state(&self, state: StrategyState) -> Result<()> {
        sqlx::query(
            "INSERT INTO strategy_state (
                deployment_ref, phase, active_group, standby_group,
                batches_completed, total_batches, canary_traffic_pct, canary_passed
             ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
             ON CONFLICT (deployment_ref) DO UPDATE SET
                phase = EXCLUDED.phase, active_group = EXCLUDED.active_group,
                standby_group = EXCLUDED.standby_group, batches_completed = EXCLUDED.batches_completed,
                total_batches = EXCLUDED.total_batches, canary_traffic_pct = EXCLUDED.canary_traffic_pct,
                canary_passed = EXCLUDED.canary_passed",
        )
        .bind(state.deployment_ref)
        .bind(state.phase)
        .bind(&state.active_group)
        .bind(&state.standby_group)
        .bind(state.batches_completed as i32)
        .bind(state.total_batches as i32)
        .bind(state.canary_traffic_pct as i16)
        .bind(state.canary_passed)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn record_phase_transition(&self, transition: PhaseTransition) -> Result<()> {
        sqlx::query(
            "INSERT INTO phase_transitions
                (deployment_ref, from_phase, to_phase, duration_seconds, reason, occurred_at)
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(transition.deployment_ref)
        .bind(transition.from)
        .bind(transition.to)
        .bind(transition.duration_seconds)
        .bind(&transition.reason)
        .bind(transition.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn list_containers(&self, deployment_ref: DeploymentId) -> Result<Vec<Container>> {
        let rows = sqlx::query("SELECT * FROM containers WHERE deployment_ref = $1")
            .bind(deployment_ref)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(container_from_row).collect()
    }

    async fn get_container(&self, id: ContainerId) -> Result<Option<Container>> {
        let row = sqlx::query("SELECT * FROM containers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(container_from_row).transpose()
    }

    async fn put_container(&self, container: Container) -> Result<()> {
        sqlx::query(
            "INSERT INTO containers (
                id, deployment_ref, runtime_id, group_name, status, health_status,
                replica_index, is_active, is_primary, internal_ip, port
             ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
             ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status, health_status = EXCLUDED.health_status,
                is_active = EXCLUDED.is_active, is_primary = EXCLUDED.is_primary,
                internal_ip = EXCLUDED.internal_ip",
        )
        .bind(container.id)
        .bind(container.deployment_ref)
        .bind(container.runtime_id)
        .bind(container.group)
        .bind(container.status)
        .bind(container.health_status)
        .bind(container.replica_index as i32)
        .bind(container.is_active)
        .bind(container.is_primary)
        .bind(container.internal_ip)
        .bind(container.port as i32)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn delete_container(&self, id: ContainerId) -> Result<()> {
        sqlx::query("DELETE FROM containers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}
