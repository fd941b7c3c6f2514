//! Jittered exponential backoff
//!
//! Shared by the embedding cache, vector index calls, and linker-transaction
//! retries: transient and logical-conflict errors are retried with
//! exponential backoff and jitter, capped at a configurable retry count.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryPolicy;

/// Run `op` up to `policy.max + 1` times (the first attempt plus `max`
/// retries), sleeping with jittered exponential backoff between attempts.
/// Returns the last error if every attempt fails.
pub fn with_backoff<T, E>(
    policy: &RetryPolicy,
    mut op: impl FnMut(u32) -> std::result::Result<T, E>,
) -> std::result::Result<T, E> {
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= policy.max {
                    return Err(e);
                }
                std::thread::sleep(backoff_duration(policy, attempt));
                attempt += 1;
            }
        }
    }
}

/// Async variant of [`with_backoff`] for operations that must `.await`.
pub async fn with_backoff_async<T, E, Fut>(
    policy: &RetryPolicy,
    mut op: impl FnMut(u32) -> Fut,
) -> std::result::Result<T, E>
where
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= policy.max {
                    return Err(e);
                }
                tokio::time::sleep(backoff_duration(policy, attempt)).await;
                attempt += 1;
            }
        }
    }
}

fn backoff_duration(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.initial_backoff_ms.saturating_mul(1u64 << attempt.min(16));
    let jitter = if policy.jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=policy.jitter_ms)
    };
    Duration::from_millis(base.saturating_add(jitter))
}
