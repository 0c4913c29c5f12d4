//! Reconnection backoff: exponential delay with a hard attempt ceiling.

use std::time::Duration;

pub(crate) const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Decides whether to retry after an unexpected close, and after how long.
///
/// The delay doubles per attempt starting at `base_delay`
/// (1s, 2s, 4s, ... with defaults). Once `max_attempts` retries have been
/// scheduled without an intervening successful open, the client gives up and
/// settles in [`Disconnected`](crate::ConnectionState::Disconnected).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Number of retries allowed between successful opens.
    pub max_attempts: u32,
    /// Add up to one `base_delay` of noise to each scheduled delay.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter: false,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
            jitter: false,
        }
    }

    /// `base_delay * 2^attempt`, saturating at `Duration::MAX`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .map_or(Duration::MAX, |factor| self.base_delay.saturating_mul(factor))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// The delay actually scheduled: [`next_delay`](Self::next_delay) plus
    /// jitter when enabled.
    pub(crate) fn scheduled_delay(&self, attempt: u32) -> Duration {
        let delay = self.next_delay(attempt);
        if !self.jitter {
            return delay;
        }
        let window = u64::try_from(self.base_delay.as_nanos()).unwrap_or(u64::MAX);
        if window == 0 {
            return delay;
        }
        // Subsecond nanos from the wall clock are enough to spread clients apart.
        let nanos = u64::from(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos(),
        );
        delay.saturating_add(Duration::from_nanos(nanos % window))
    }
}
