//! Bounded reconnect policy.
//!
//! Used by the notification stream when the service asks for a reload: the
//! first attempt is immediate, later attempts back off exponentially with a
//! little jitter, and the budget is finite.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Limits for reconnecting after a reload request.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Maximum number of connect attempts per reload, including the first.
    pub max_attempts: usize,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for the exponential delay.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each delay.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: usize = 5;

    /// A single immediate attempt with no retries.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Delay to wait before the given 1-based attempt.
    ///
    /// The first attempt never waits.
    pub fn delay_before_attempt(&self, attempt: usize) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let mut delay = self.initial_backoff;
        for _ in 2..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        std::cmp::min(delay, self.max_backoff) + jitter_duration(self.jitter, attempt)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
            jitter: Duration::from_millis(100),
        }
    }
}

/// Runs `op` until it succeeds, `should_retry` rejects an error, or the
/// policy's attempts are used up. The last error is returned.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &ReconnectPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let delay = policy.delay_before_attempt(attempt);
        if !delay.is_zero() {
            debug!(
                event = "reconnect_backoff",
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64
            );
            tokio::time::sleep(delay).await;
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < max_attempts && should_retry(&error) => attempt += 1,
            Err(error) => return Err(error),
        }
    }
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
