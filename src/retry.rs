//! Retry with exponential backoff, parameterized by a transient predicate.
//!
//! Only errors the predicate calls transient are retried; anything else is
//! returned on the spot.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Upper bound on a single delay.
    pub max_delay_ms: u64,
    /// Randomize each delay between half and all of its nominal value.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Nominal delay after the given (1-based) attempt failed:
    /// `base_delay_ms * 2^(attempt - 1)`, capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(32);
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(exp))
            .min(self.max_delay_ms)
    }

    fn jittered_delay(&self, attempt: u32) -> u64 {
        let delay = self.delay_for_attempt(attempt);
        if !self.jitter || delay < 2 {
            return delay;
        }
        let half = delay / 2;
        half + rand::rng().random_range(0..=delay - half)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy runs out of attempts. `op` receives the 1-based attempt number.
pub async fn with_backoff<T, E, F, Fut, P>(policy: &RetryPolicy, is_transient: P, op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    with_backoff_after(policy, is_transient, |_| None, op).await
}

/// Like [`with_backoff`], but an error may name a minimum wait in
/// milliseconds (a `retry-after`). The next delay is never shorter than that.
pub async fn with_backoff_after<T, E, F, Fut, P, H>(
    policy: &RetryPolicy,
    is_transient: P,
    retry_after: H,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    H: Fn(&E) -> Option<u64>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && is_transient(&e) => {
                let delay_ms = policy
                    .jittered_delay(attempt)
                    .max(retry_after(&e).unwrap_or(0));
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms,
                    error = %e,
                    "transient failure, retrying"
                );
                sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
