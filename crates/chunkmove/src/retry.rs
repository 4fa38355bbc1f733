//! Bounded exponential backoff for transient remote failures.

use std::hash::{Hash, Hasher};
use std::time::Duration;

const MAX_SHIFT: u32 = 6;

/// Retry schedule handed to a coordinator.
///
/// `max_attempts` counts every call including the first, so `1` means no
/// retries. Delays double per failure from `base_delay` up to `max_delay` and
/// carry deterministic jitter in [80%, 120%].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures,
    /// or `None` once the attempt budget is spent.
    ///
    /// `salt` spreads retries of different sessions apart.
    pub fn delay_after(&self, salt: u64, failures: u32) -> Option<Duration> {
        if failures == 0 {
            return Some(Duration::ZERO);
        }
        if failures >= self.max_attempts {
            return None;
        }
        Some(self.backoff(salt, failures))
    }

    /// Delay for work that must eventually succeed, such as settling an
    /// ownership change the catalog may already hold. Never runs out; past
    /// the attempt budget it stays at the capped delay.
    pub fn persistent_delay(&self, salt: u64, failures: u32) -> Duration {
        self.backoff(salt, failures.max(1))
            .max(Duration::from_millis(1))
    }

    fn backoff(&self, salt: u64, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(MAX_SHIFT);
        let base_ms = self.base_delay.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max_delay.as_millis().min(u128::from(u64::MAX)) as u64;
        let capped_ms = base_ms.saturating_mul(1u64 << shift).min(max_ms);

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        salt.hash(&mut hasher);
        failures.hash(&mut hasher);
        let jitter_percent = 80u64 + (hasher.finish() % 41);
        Duration::from_millis(capped_ms.saturating_mul(jitter_percent) / 100)
    }
}
