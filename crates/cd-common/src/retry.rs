//! Bounded exponential backoff for the Transient I/O error class (spec §7):
//! 50ms -> 5s, capped, with jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, ErrorKind};

const BASE: Duration = Duration::from_millis(50);
const CAP: Duration = Duration::from_secs(5);

pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE.as_millis().saturating_mul(1u128 << attempt.min(16));
    let capped = exp.min(CAP.as_millis());
    let jitter = rand::thread_rng().gen_range(0..=capped.max(1) / 4 + 1);
    Duration::from_millis((capped + jitter) as u64)
}

/// Retries `f` up to `max_attempts` times while the returned error is
/// retriable (Transient I/O); any other error, or the final attempt's
/// error, is returned immediately/promoted to terminal (spec §7).
pub async fn with_backoff<T, F, Fut>(max_attempts: u32, mut f: F) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    loop {
        match f(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if e.kind().is_retriable() && attempt + 1 < max_attempts => {
                tokio::time::sleep(backoff_delay(attempt)).await;
                attempt += 1;
            }
            Err(e) if e.kind().is_retriable() => {
                return Err(Error::custom(
                    e.kind(),
                    format!("exhausted {max_attempts} retries"),
                ))
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_never_exceeds_cap_plus_jitter_headroom() {
        for attempt in 0..20 {
            let d = backoff_delay(attempt);
            assert!(d <= CAP + Duration::from_secs(2));
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, Error> = with_backoff(5, |_attempt| {
            let calls = &calls;
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(Error::from_kind(ErrorKind::StoreUnavailable))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_retries_logic_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, Error> = with_backoff(5, |_| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::from_kind(ErrorKind::MalformedMessage))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn promotes_to_terminal_after_budget_exhausted() {
        let result: Result<u32, Error> = with_backoff(3, |_| async {
            Err(Error::from_kind(ErrorKind::RegistryUnavailable))
        })
        .await;
        assert!(result.is_err());
    }
}
