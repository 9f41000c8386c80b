//! A scoped-acquisition guard so a ticket is released on every exit path,
//! crash-free runs included (spec §4.1, §5, Invariant 4 of §8).

use std::sync::Arc;

use tracing::error;

use crate::limiter::{QuotaLimiter, Ticket};

pub struct TicketGuard {
    ticket: Option<Ticket>,
    limiter: Arc<dyn QuotaLimiter>,
}

impl TicketGuard {
    pub fn new(ticket: Ticket, limiter: Arc<dyn QuotaLimiter>) -> Self {
        Self {
            ticket: Some(ticket),
            limiter,
        }
    }

    /// Releases the ticket explicitly. Prefer this on the normal exit path;
    /// the `Drop` impl is the backstop for early returns and panics.
    pub async fn release(mut self) {
        if let Some(ticket) = self.ticket.take() {
            if let Err(err) = self.limiter.release(ticket).await {
                error!(error = %err, "failed to release QRL ticket");
            }
        }
    }
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            let limiter = self.limiter.clone();
            // No async Drop in stable Rust: hand the release off to a
            // detached task so an early `?`-return or panic still releases
            // the ticket, matching the "guaranteed release on every exit
            // path" requirement in spec §4.3 step 9.
            tokio::spawn(async move {
                if let Err(err) = limiter.release(ticket).await {
                    error!(error = %err, "failed to release QRL ticket on drop");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cd_common::ids::TenantRef;
    use cd_common::model::QuotaDimension;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLimiter {
        releases: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl QuotaLimiter for CountingLimiter {
        async fn reserve_build(
            &self,
            _tenant: TenantRef,
            _idempotency_key: &str,
            _limits: crate::limiter::Limits,
        ) -> cd_common::Result<Ticket> {
            unimplemented!()
        }

        async fn reserve_deployment(
            &self,
            _tenant: TenantRef,
            _idempotency_key: &str,
            _limits: crate::limiter::Limits,
        ) -> cd_common::Result<Ticket> {
            unimplemented!()
        }

        async fn release(&self, _ticket: Ticket) -> cd_common::Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn record_usage(
            &self,
            _tenant: TenantRef,
            _dimension: QuotaDimension,
            _delta: i64,
        ) -> cd_common::Result<()> {
            Ok(())
        }
    }

    fn fake_ticket() -> Ticket {
        Ticket {
            key: "test".into(),
            tenant: TenantRef::new(),
            dimension: QuotaDimension::ConcurrentBuilds,
        }
    }

    #[tokio::test]
    async fn explicit_release_calls_limiter_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let limiter = Arc::new(CountingLimiter {
            releases: releases.clone(),
        });
        let guard = TicketGuard::new(fake_ticket(), limiter);
        guard.release().await;
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_without_explicit_release_still_releases() {
        let releases = Arc::new(AtomicUsize::new(0));
        let limiter = Arc::new(CountingLimiter {
            releases: releases.clone(),
        });
        {
            let _guard = TicketGuard::new(fake_ticket(), limiter);
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }
}
