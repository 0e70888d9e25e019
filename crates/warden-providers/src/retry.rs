//! Exponential backoff with jitter for rate-limited provider calls.
//!
//! Base 5s, factor 2, cap 120s, max 5 attempts. Non-rate-limit errors
//! propagate immediately; sleeps are interruptible by a cancellation check.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use warden_domain::error::{Error, Result};
use warden_domain::trace::TraceEvent;

const BASE_SECS: f64 = 5.0;
const FACTOR: f64 = 2.0;
const CAP_SECS: f64 = 120.0;
const MAX_ATTEMPTS: u32 = 5;

fn backoff_for(attempt: u32) -> Duration {
    let scaled = BASE_SECS * FACTOR.powi(attempt.saturating_sub(1) as i32);
    let capped = scaled.min(CAP_SECS);
    let jitter = rand::thread_rng().gen_range(0.0..=capped * 0.25);
    Duration::from_secs_f64(capped + jitter)
}

/// Sleeps for `dur`, waking early (returning `true`) if `cancellation_check`
/// ever reports cancellation. Polls at a fixed short interval rather than
/// sleeping the whole duration in one shot.
async fn interruptible_sleep(
    dur: Duration,
    cancellation_check: Option<&(dyn Fn() -> bool + Send + Sync)>,
) -> bool {
    let Some(check) = cancellation_check else {
        tokio::time::sleep(dur).await;
        return false;
    };
    let step = Duration::from_millis(100);
    let mut remaining = dur;
    loop {
        if check() {
            return true;
        }
        if remaining.is_zero() {
            return false;
        }
        let this_step = step.min(remaining);
        tokio::time::sleep(this_step).await;
        remaining -= this_step;
    }
}

/// Runs `f` up to [`MAX_ATTEMPTS`] times, retrying only on
/// `Error::RateLimited`. All other errors propagate immediately.
pub async fn with_retry<T, F, Fut>(
    provider_id: &str,
    cancellation_check: Option<&(dyn Fn() -> bool + Send + Sync)>,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(Error::RateLimited { provider, .. }) if attempt < MAX_ATTEMPTS => {
                let backoff = backoff_for(attempt);
                TraceEvent::LlmRetry {
                    provider: provider.clone(),
                    attempt,
                    backoff_ms: backoff.as_millis() as u64,
                    reason: "rate_limited".into(),
                }
                .emit();
                if interruptible_sleep(backoff, cancellation_check).await {
                    return Err(Error::Cancelled);
                }
                continue;
            }
            Err(Error::RateLimited { provider, attempts: _ }) => {
                return Err(Error::RateLimited {
                    provider,
                    attempts: attempt,
                });
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_retry("p", None, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_rate_limit_errors_propagate_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_retry("p", None, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Other("boom".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_check_aborts_backoff() {
        let result: Result<u32> = with_retry(
            "p",
            Some(&|| true),
            || async { Err(Error::RateLimited { provider: "p".into(), attempts: 1 }) },
        )
        .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
