//! Reconnect scheduling and timeout utilities.
//!
//! The schedule mirrors the common "list of delays, then a fallback" shape:
//! attempt `n` waits `delays[n - 1]`, and every attempt past the end of the
//! list waits `fallback`.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Delay schedule applied between reconnect attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectSchedule {
    /// Delays used for the first attempts, in order.
    pub delays: Vec<Duration>,
    /// Delay used for every attempt beyond `delays`.
    pub fallback: Duration,
}

impl ReconnectSchedule {
    /// Builds a schedule from millisecond values.
    pub fn from_millis(delays_ms: &[u64], fallback_ms: u64) -> Self {
        Self {
            delays: delays_ms.iter().copied().map(Duration::from_millis).collect(),
            fallback: Duration::from_millis(fallback_ms),
        }
    }

    /// Returns the delay before the given reconnect attempt.
    ///
    /// `attempt` is 1-based; `0` is treated as the first attempt.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let index = attempt.max(1) - 1;
        let delay = self.delays.get(index).copied().unwrap_or(self.fallback);
        debug!(
            event = "reconnect_delay_selected",
            attempt,
            delay_ms = delay.as_millis() as u64
        );
        delay
    }
}

impl Default for ReconnectSchedule {
    fn default() -> Self {
        Self::from_millis(&[1_000, 5_000, 10_000], 10_000)
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}
