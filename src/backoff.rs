//! Bounded exponential backoff
//!
//! One policy type shared by RPC retries, session reconnects and pairing
//! reconnects.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Network failures: a handful of fast attempts
    pub const fn network() -> Self {
        Self::new(5, Duration::from_millis(500), Duration::from_secs(8))
    }

    /// Node warm-up: many attempts, capped short delay
    pub const fn node_busy() -> Self {
        Self::new(120, Duration::from_secs(1), Duration::from_secs(5))
    }

    /// A single attempt, no retry
    pub const fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay to wait after the given failed attempt (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Run `op` until it succeeds, `is_fatal` says stop, or the policy runs out.
/// The last error is returned.
pub async fn retry<T, E, F, Fut, P>(policy: &BackoffPolicy, is_fatal: P, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if is_fatal(&err) || !policy.allows(attempt) {
                    return Err(err);
                }
                tokio::time::sleep(policy.delay_for(attempt - 1)).await;
            }
        }
    }
}
