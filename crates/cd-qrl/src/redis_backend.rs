use cd_common::error::{Error, ErrorKind};
use cd_common::ids::TenantRef;
use cd_common::model::QuotaDimension;
use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::warn;

use crate::limiter::{
    concurrency_key, monthly_key, rate_bucket_key, ticket_key, Limits, QuotaLimiter, Ticket,
};

/// Atomic compare-and-increment: only admits if the idempotency ticket key
/// is not already held and the concurrency counter is under the ceiling.
/// Mirrors spec §4.1: "`reserve_*` is a compare-and-increment; on failure
/// nothing is mutated."
static RESERVE_CONCURRENCY: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local ticket_key = KEYS[1]
        local counter_key = KEYS[2]
        local max_concurrent = tonumber(ARGV[1])
        local ticket_ttl = tonumber(ARGV[2])

        if redis.call("EXISTS", ticket_key) == 1 then
            return 1 -- already reserved by a previous delivery: idempotent success
        end

        local current = tonumber(redis.call("GET", counter_key) or "0")
        if current >= max_concurrent then
            return 0
        end

        redis.call("INCR", counter_key)
        redis.call("SET", ticket_key, "1", "EX", ticket_ttl)
        return 1
        "#,
    )
});

static RELEASE_CONCURRENCY: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local ticket_key = KEYS[1]
        local counter_key = KEYS[2]

        if redis.call("EXISTS", ticket_key) == 0 then
            return 0 -- unknown or already-released: fail silently
        end

        redis.call("DEL", ticket_key)
        local current = tonumber(redis.call("GET", counter_key) or "0")
        if current > 0 then
            redis.call("DECR", counter_key)
        end
        return 1
        "#,
    )
});

/// 1-minute granularity sliding window with exponential smoothing: the
/// current minute's bucket is compared against a smoothed estimate of the
/// previous bucket, weighted by how far into the current minute we are.
static CHECK_RATE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local current_key = KEYS[1]
        local previous_key = KEYS[2]
        local limit = tonumber(ARGV[1])
        local elapsed_fraction = tonumber(ARGV[2])

        local current = tonumber(redis.call("GET", current_key) or "0")
        local previous = tonumber(redis.call("GET", previous_key) or "0")

        local estimate = previous * (1 - elapsed_fraction) + current
        if estimate >= limit then
            return 0
        end

        redis.call("INCR", current_key)
        redis.call("EXPIRE", current_key, 120)
        return 1
        "#,
    )
});

const TICKET_TTL_SECONDS: i64 = 3600;

#[derive(Clone)]
pub struct RedisQuotaLimiter {
    conn: ConnectionManager,
}

impl RedisQuotaLimiter {
    pub async fn connect(cache_url: &str) -> cd_common::Result<Self> {
        let client = redis::Client::open(cache_url)
            .map_err(|e| Error::source(ErrorKind::ConfigurationInvalid, e))?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .map_err(|e| Error::source(ErrorKind::CacheUnavailable, e))?;
        Ok(Self { conn })
    }

    fn month_window() -> String {
        let now = Utc::now();
        format!("{:04}-{:02}", now.year(), now.month())
    }

    async fn check_rate(&self, tenant: TenantRef, dimension: QuotaDimension, limits: Limits) -> cd_common::Result<()> {
        if limits.rate_per_minute == 0 {
            return Ok(());
        }
        let now = Utc::now();
        let minute = now.timestamp() / 60;
        let elapsed_fraction = (now.timestamp() % 60) as f64 / 60.0;
        let current_key = rate_bucket_key(tenant, dimension, minute);
        let previous_key = rate_bucket_key(tenant, dimension, minute - 1);

        let mut conn = self.conn.clone();
        let admitted: i32 = CHECK_RATE
            .key(current_key)
            .key(previous_key)
            .arg(limits.rate_per_minute)
            .arg(elapsed_fraction)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::source(ErrorKind::CacheUnavailable, e))?;

        if admitted == 0 {
            return Err(Error::from_kind(ErrorKind::RateLimited));
        }
        Ok(())
    }

    async fn check_monthly(&self, tenant: TenantRef, dimension: QuotaDimension, limits: Limits) -> cd_common::Result<()> {
        if limits.monthly_allotment <= 0 {
            return Ok(());
        }
        let key = monthly_key(tenant, dimension, &Self::month_window());
        let mut conn = self.conn.clone();
        let used: i64 = conn
            .get(&key)
            .await
            .map_err(|e| Error::source(ErrorKind::CacheUnavailable, e))?
            .unwrap_or(0);
        if used >= limits.monthly_allotment {
            return Err(Error::from_kind(ErrorKind::QuotaExhausted));
        }
        Ok(())
    }

    async fn reserve(
        &self,
        tenant: TenantRef,
        dimension: QuotaDimension,
        idempotency_key: &str,
        limits: Limits,
    ) -> cd_common::Result<Ticket> {
        self.check_rate(tenant, dimension, limits).await?;
        self.check_monthly(tenant, dimension, limits).await?;

        let t_key = ticket_key(tenant, dimension, idempotency_key);
        let c_key = concurrency_key(tenant, dimension);

        let mut conn = self.conn.clone();
        let admitted: i32 = RESERVE_CONCURRENCY
            .key(t_key.clone())
            .key(c_key)
            .arg(limits.max_concurrent)
            .arg(TICKET_TTL_SECONDS)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::source(ErrorKind::CacheUnavailable, e))?;

        if admitted == 0 {
            return Err(Error::from_kind(ErrorKind::ConcurrencyExceeded));
        }

        Ok(Ticket {
            key: t_key,
            tenant,
            dimension,
        })
    }
}

#[async_trait::async_trait]
impl QuotaLimiter for RedisQuotaLimiter {
    async fn reserve_build(
        &self,
        tenant: TenantRef,
        idempotency_key: &str,
        limits: Limits,
    ) -> cd_common::Result<Ticket> {
        self.reserve(tenant, QuotaDimension::ConcurrentBuilds, idempotency_key, limits)
            .await
    }

    async fn reserve_deployment(
        &self,
        tenant: TenantRef,
        idempotency_key: &str,
        limits: Limits,
    ) -> cd_common::Result<Ticket> {
        self.reserve(
            tenant,
            QuotaDimension::ConcurrentDeployments,
            idempotency_key,
            limits,
        )
        .await
    }

    async fn release(&self, ticket: Ticket) -> cd_common::Result<()> {
        let c_key = concurrency_key(ticket.tenant, ticket.dimension);
        let mut conn = self.conn.clone();
        let released: i32 = RELEASE_CONCURRENCY
            .key(ticket.key)
            .key(c_key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::source(ErrorKind::CacheUnavailable, e))?;
        if released == 0 {
            warn!("release called on an unknown or already-released ticket; ignoring");
        }
        Ok(())
    }

    async fn record_usage(
        &self,
        tenant: TenantRef,
        dimension: QuotaDimension,
        delta: i64,
    ) -> cd_common::Result<()> {
        let key = monthly_key(tenant, dimension, &Self::month_window());
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .incr(&key, delta)
            .await
            .map_err(|e| Error::source(ErrorKind::CacheUnavailable, e))?;
        Ok(())
    }
}
