//! Retry delay: exponential backoff with jitter, capped.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::Policies;

/// Delay schedule for requeued tasks.
///
/// `multiplier = 1.0` with `jitter = 0.0` gives a flat delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryBackoff {
    /// Delay before the first retry (milliseconds).
    pub base_delay_ms: u64,
    /// Growth factor per retry.
    pub multiplier: f64,
    /// Upper bound for any delay, jitter included (milliseconds).
    pub max_delay_ms: u64,
    /// Fraction of the delay randomly added or removed, in [0, 1].
    pub jitter: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::from_policies(&Policies::default())
    }
}

impl RetryBackoff {
    pub fn from_policies(policies: &Policies) -> Self {
        Self {
            base_delay_ms: policies.retry_delay_ms,
            multiplier: policies.backoff_multiplier,
            max_delay_ms: policies.max_retry_delay_ms.max(policies.retry_delay_ms),
            jitter: policies.retry_jitter.clamp(0.0, 1.0),
        }
    }

    /// Flat delay with no growth and no jitter.
    pub fn flat(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            base_delay_ms: ms,
            multiplier: 1.0,
            max_delay_ms: ms,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// `unit` is a uniform sample in [0, 1); 0.5 yields the un-jittered delay.
    pub fn delay_for(&self, retry: u32, unit: f64) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        let spread = capped * self.jitter * (2.0 * unit.clamp(0.0, 1.0) - 1.0);
        let ms = (capped + spread).clamp(0.0, self.max_delay_ms as f64);
        Duration::from_millis(ms.round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_doubles_from_five_seconds() {
        let b = RetryBackoff::default();
        assert_eq!(b.delay_for(1, 0.5), Duration::from_millis(5_000));
        assert_eq!(b.delay_for(2, 0.5), Duration::from_millis(10_000));
        assert_eq!(b.delay_for(3, 0.5), Duration::from_millis(20_000));
    }

    #[test]
    fn delay_is_capped() {
        let b = RetryBackoff::default();
        assert_eq!(b.delay_for(10, 0.5), Duration::from_millis(60_000));
        // Jitter never pushes past the cap.
        assert_eq!(b.delay_for(10, 0.99), Duration::from_millis(60_000));
    }

    #[test]
    fn jitter_stays_within_band() {
        let b = RetryBackoff::default();
        let low = b.delay_for(1, 0.0);
        let high = b.delay_for(1, 0.999);
        assert_eq!(low, Duration::from_millis(4_500));
        assert!(high <= Duration::from_millis(5_500));
        assert!(high > Duration::from_millis(5_400));
    }

    #[test]
    fn flat_delay_ignores_retry_number() {
        let b = RetryBackoff::flat(Duration::from_secs(5));
        assert_eq!(b.delay_for(1, 0.1), Duration::from_secs(5));
        assert_eq!(b.delay_for(7, 0.9), Duration::from_secs(5));
    }

    #[test]
    fn policies_drive_schedule() {
        let policies = Policies {
            retry_delay_ms: 100,
            backoff_multiplier: 3.0,
            max_retry_delay_ms: 500,
            retry_jitter: 0.0,
            ..Policies::default()
        };
        let b = RetryBackoff::from_policies(&policies);
        assert_eq!(b.delay_for(1, 0.0), Duration::from_millis(100));
        assert_eq!(b.delay_for(2, 0.0), Duration::from_millis(300));
        assert_eq!(b.delay_for(3, 0.0), Duration::from_millis(500));
    }
}
