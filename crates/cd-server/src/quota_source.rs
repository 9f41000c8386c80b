//! `cd_qrl::sweeper::ActiveCountSource` over the durable store (spec §8
//! Invariant 4: "on crash, a sweeper reconciles counters from the durable
//! store"). `Build`/`Deployment` only carry `project_ref`; tenant
//! resolution goes through `projects`.

use async_trait::async_trait;
use cd_common::ids::TenantRef;
use cd_common::model::QuotaDimension;
use cd_common::{Error, ErrorKind, Result};
use cd_qrl::sweeper::ActiveCountSource;
use sqlx::{PgPool, Row};

pub struct PgActiveCountSource {
    pool: PgPool,
}

impl PgActiveCountSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn store_err<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
    Error::source(ErrorKind::StoreUnavailable, err)
}

#[async_trait]
impl ActiveCountSource for PgActiveCountSource {
    async fn tenants(&self) -> Result<Vec<TenantRef>> {
        let rows = sqlx::query("SELECT DISTINCT tenant_ref FROM projects WHERE deleted_at IS NULL")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter()
            .map(|row| row.try_get("tenant_ref").map_err(store_err))
            .collect()
    }

    async fn active_count(&self, tenant: TenantRef, dimension: QuotaDimension) -> Result<i64> {
        let row = match dimension {
            QuotaDimension::ConcurrentBuilds => {
                sqlx::query(
                    "SELECT count(*) AS n FROM builds b
                     JOIN projects p ON p.project_ref = b.project_ref
                     WHERE p.tenant_ref = $1
                       AND b.status IN ('queued','cloning','installing','building','pushing')",
                )
                .bind(tenant)
                .fetch_one(&self.pool)
                .await
            }
            QuotaDimension::ConcurrentDeployments => {
                sqlx::query(
                    "SELECT count(*) AS n FROM deployments d
                     JOIN projects p ON p.project_ref = d.project_ref
                     WHERE p.tenant_ref = $1
                       AND d.status IN ('pending','deploying')",
                )
                .bind(tenant)
                .fetch_one(&self.pool)
                .await
            }
            // Per-month counters are rate windows, not in-flight concurrency;
            // the sweeper only reconciles the two concurrency dimensions
            // (spec §8 Invariant 4 names "the concurrent-deployment counter").
            QuotaDimension::BuildsPerMonth | QuotaDimension::DeploysPerMonth => {
                return Ok(0);
            }
        }
        .map_err(store_err)?;
        row.try_get::<i64, _>("n").map_err(store_err)
    }
}
