use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use super::error::{is_transient, ProviderError};

/// Exponential backoff policy for transient provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Run `op` with retries on transient errors only. A 429 carrying
/// Retry-After overrides the computed backoff delay.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt > policy.max_retries || !is_transient(&e) {
                    return Err(e);
                }

                let wait = e
                    .downcast_ref::<ProviderError>()
                    .and_then(|pe| pe.retry_after_secs)
                    .map(Duration::from_secs)
                    .map(|ra| ra.max(delay.min(policy.max_delay)).min(policy.max_delay))
                    .unwrap_or_else(|| delay.min(policy.max_delay));

                warn!(
                    label,
                    attempt,
                    wait_secs = wait.as_secs(),
                    "Transient failure, backing off: {}",
                    e
                );
                tokio::time::sleep(wait).await;
                delay = delay
                    .saturating_mul(policy.factor)
                    .min(policy.max_delay);
                debug!(label, attempt, "retrying");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(5),
            factor: 2,
            max_delay: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let out = with_retry(fast_policy(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::from_status(503, "unavailable", None).into())
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let out: anyhow::Result<()> = with_retry(fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::from_status(500, "boom", None).into()) }
        })
        .await;
        assert!(out.is_err());
        // initial attempt + 3 retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn auth_errors_fail_immediately() {
        let calls = AtomicU32::new(0);
        let out: anyhow::Result<()> = with_retry(fast_policy(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::from_status(401, "bad key", None).into()) }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limit_honors_retry_after() {
        let calls = AtomicU32::new(0);
        let start = std::time::Instant::now();
        // Keep Retry-After tiny but observable with a generous max_delay.
        let policy = RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            factor: 2,
            max_delay: Duration::from_secs(30),
        };
        let out = with_retry(policy, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::from_status(429, "", Some(0)).into())
                } else {
                    Ok("payload")
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, "payload");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Retry-After of 0s means no mandatory sleep beyond backoff floor.
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
