//! Reconnect backoff after unexpected provider disconnects.

use std::time::Duration;

/// Exponential reconnect policy with a cap.
///
/// - attempt 1 (the first disconnect after a healthy connection): immediate
/// - attempt n > 1: `base_delay * 2^(n - 2)`, capped at `max_delay`
///
/// The number of attempts is unbounded; only the spacing grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Reconnect immediately on every disconnect (the unthrottled behavior).
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        // Shift is clamped so the multiplication cannot overflow before the cap applies.
        let exp = (attempt - 2).min(20);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
