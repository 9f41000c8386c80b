//! Periodic counter reconciliation (spec §8, Invariant 4: "on crash, a
//! sweeper reconciles counters from the durable store").

use std::sync::Arc;
use std::time::Duration;

use cd_common::ids::TenantRef;
use cd_common::model::QuotaDimension;
use redis::AsyncCommands;
use tracing::{info, warn};

use crate::limiter::concurrency_key;

/// Supplies the ground truth: how many builds/deployments are actually
/// in-flight for a tenant, as observed from the durable store. `cd-server`
/// implements this over the `builds`/`deployments` tables.
#[async_trait::async_trait]
pub trait ActiveCountSource: Send + Sync {
    async fn tenants(&self) -> cd_common::Result<Vec<TenantRef>>;
    async fn active_count(&self, tenant: TenantRef, dimension: QuotaDimension) -> cd_common::Result<i64>;
}

pub struct Sweeper {
    conn: redis::aio::ConnectionManager,
    source: Arc<dyn ActiveCountSource>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        conn: redis::aio::ConnectionManager,
        source: Arc<dyn ActiveCountSource>,
        interval: Duration,
    ) -> Self {
        Self {
            conn,
            source,
            interval,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            if let Err(err) = self.sweep_once().await {
                warn!(error = %err, "quota counter sweep failed");
            }
        }
    }

    pub async fn sweep_once(&mut self) -> cd_common::Result<()> {
        let tenants = self.source.tenants().await?;
        for tenant in tenants {
            for dimension in [
                QuotaDimension::ConcurrentBuilds,
                QuotaDimension::ConcurrentDeployments,
            ] {
                let truth = self.source.active_count(tenant, dimension).await?;
                let key = concurrency_key(tenant, dimension);
                let cached: i64 = self
                    .conn
                    .get(&key)
                    .await
                    .map_err(|e| cd_common::Error::source(cd_common::ErrorKind::CacheUnavailable, e))?
                    .unwrap_or(0);
                if cached != truth {
                    info!(
                        tenant = %tenant,
                        %dimension,
                        cached,
                        truth,
                        "reconciling quota counter drift"
                    );
                    let _: () = self
                        .conn
                        .set(&key, truth)
                        .await
                        .map_err(|e| cd_common::Error::source(cd_common::ErrorKind::CacheUnavailable, e))?;
                }
            }
        }
        Ok(())
    }
}
