use cd_common::ids::TenantRef;
use cd_common::model::QuotaDimension;

/// Admission limits for a single `reserve_*` call (spec §4.1). The control
/// plane that enqueues build/deploy jobs is responsible for resolving these
/// from the tenant's plan; QRL only enforces them.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub max_concurrent: u32,
    pub rate_per_minute: u32,
    pub monthly_allotment: i64,
}

/// The opaque receipt returned by a successful `reserve_*` call. Must be
/// released exactly once (spec GLOSSARY). The ticket key is deterministic
/// over `(tenant, dimension, idempotency_key)` so that redelivering the same
/// message never double-counts the concurrency ceiling (spec §4.1).
#[derive(Clone, Debug)]
pub struct Ticket {
    pub(crate) key: String,
    pub(crate) tenant: TenantRef,
    pub(crate) dimension: QuotaDimension,
}

impl Ticket {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Lets other crates' fakes hand out a `Ticket` without depending on QRL's
/// own backend, e.g. a deploy-orchestrator test double's `reserve_deployment`.
pub mod testing {
    use super::*;

    pub fn fake_ticket(tenant: TenantRef, dimension: QuotaDimension) -> Ticket {
        Ticket {
            key: format!("test:{tenant}:{dimension}"),
            tenant,
            dimension,
        }
    }
}

pub(crate) fn ticket_key(tenant: TenantRef, dimension: QuotaDimension, idempotency_key: &str) -> String {
    format!("qrl:ticket:{tenant}:{dimension}:{idempotency_key}")
}

pub(crate) fn concurrency_key(tenant: TenantRef, dimension: QuotaDimension) -> String {
    format!("qrl:concurrency:{tenant}:{dimension}")
}

pub(crate) fn rate_bucket_key(tenant: TenantRef, dimension: QuotaDimension, minute: i64) -> String {
    format!("qrl:rate:{tenant}:{dimension}:{minute}")
}

pub(crate) fn monthly_key(tenant: TenantRef, dimension: QuotaDimension, window: &str) -> String {
    format!("qrl:monthly:{tenant}:{dimension}:{window}")
}

#[async_trait::async_trait]
pub trait QuotaLimiter: Send + Sync {
    async fn reserve_build(
        &self,
        tenant: TenantRef,
        idempotency_key: &str,
        limits: Limits,
    ) -> cd_common::Result<Ticket>;

    async fn reserve_deployment(
        &self,
        tenant: TenantRef,
        idempotency_key: &str,
        limits: Limits,
    ) -> cd_common::Result<Ticket>;

    /// Idempotent: releasing an unknown or already-released ticket fails
    /// silently (spec §4.1).
    async fn release(&self, ticket: Ticket) -> cd_common::Result<()>;

    async fn record_usage(
        &self,
        tenant: TenantRef,
        dimension: QuotaDimension,
        delta: i64,
    ) -> cd_common::Result<()>;
}
