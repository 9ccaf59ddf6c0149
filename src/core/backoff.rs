//! Exponential backoff with jitter and cancellable waits.

use crate::models::config::RetryConfig;
use crate::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Backoff schedule for one retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryConfig) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// `base * 2^attempt`, capped at `max_delay`. With jitter the delay is
    /// drawn uniformly from the upper half of that interval.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.policy.base_delay_ms.max(1);
        let exp = base.saturating_mul(1u64 << attempt.min(20));
        let capped = exp.min(self.policy.max_delay_ms.max(base));
        let millis = if self.policy.jitter {
            rand::thread_rng().gen_range(capped / 2..=capped)
        } else {
            capped
        };
        Duration::from_millis(millis)
    }

    /// Next delay, or `None` once `max_attempts` attempts were used.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt + 1 >= self.policy.max_attempts.max(1) {
            return None;
        }
        let delay = self.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Attempts started so far, counting the first.
    pub fn attempts(&self) -> u32 {
        self.attempt + 1
    }
}

/// Sleep for `delay` unless `cancel` fires first.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(crate::Error::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Await `fut` unless `cancel` fires first.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(crate::Error::Cancelled),
        result = fut => result,
    }
}

/// Retry an idempotent operation with backoff.
///
/// Stops early on non-retryable errors. Must not be used for commands that
/// change device state.
pub async fn retry_idempotent<T, F, Fut>(
    policy: &RetryConfig,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new(policy.clone());
    loop {
        match cancellable(cancel, op()).await {
            Ok(value) => return Ok(value),
            Err(crate::Error::Cancelled) => return Err(crate::Error::Cancelled),
            Err(e) if e.is_retryable() => match backoff.next_delay() {
                Some(delay) => {
                    tracing::debug!(
                        "{} failed (attempt {}): {}; retrying in {:?}",
                        what,
                        backoff.attempts() - 1,
                        e,
                        delay
                    );
                    sleep_or_cancel(delay, cancel).await?;
                }
                None => {
                    tracing::warn!("{} failed after {} attempts: {}", what, backoff.attempts(), e);
                    return Err(e);
                }
            },
            Err(e) => return Err(e),
        }
    }
}
