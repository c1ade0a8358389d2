//! Bounded exponential backoff for transient DingTalk API failures.

use std::{future::Future, time::Duration};

use tracing::warn;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Wait before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Run `request` until it succeeds, fails with a non-retryable error, or the
/// policy's retry budget is spent.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut request: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut retries = 0u32;

    loop {
        match request().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }
                if retries >= policy.max_retries {
                    warn!(
                        operation,
                        retries,
                        max_retries = policy.max_retries,
                        error = %err,
                        "dingtalk request still failing after retries"
                    );
                    return Err(err);
                }

                retries += 1;
                let wait = policy.delay_for(retries);
                warn!(
                    operation,
                    retries,
                    max_retries = policy.max_retries,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "dingtalk request failed, retrying"
                );
                tokio::time::sleep(wait).await;
            },
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
    };

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(10), Duration::from_secs(8));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = with_retry(&RetryPolicy::default(), "token", || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(Error::api("token", 503, "busy"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let err = with_retry(&RetryPolicy::default(), "card update", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::api("card update", 500, "boom")) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let err = with_retry(&RetryPolicy::default(), "card update", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::api("card update", 404, "gone")) }
        })
        .await
        .unwrap_err();
        assert!(err.is_terminal_card_status());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn none_policy_makes_a_single_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let _ = with_retry(&RetryPolicy::none(), "send", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::api("send", 429, "slow down")) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
