use std::time::Duration;

use eventrelay_core::{DomainError, DomainResult};

/// Retry budget and backoff for one event type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Failed attempts after which an event is given up on.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1_000),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(60_000),
        }
    }
}

impl RetryConfig {
    /// Validated constructor: the backoff may not shrink and the cap may not
    /// undercut the first delay.
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        backoff_factor: f64,
        max_delay: Duration,
    ) -> DomainResult<Self> {
        if !backoff_factor.is_finite() || backoff_factor < 1.0 {
            return Err(DomainError::validation(format!(
                "backoff factor must be >= 1.0, got {backoff_factor}"
            )));
        }
        if max_delay < initial_delay {
            return Err(DomainError::validation(format!(
                "max delay {max_delay:?} is below initial delay {initial_delay:?}"
            )));
        }
        Ok(Self {
            max_retries,
            initial_delay,
            backoff_factor,
            max_delay,
        })
    }

    /// Retry immediately, up to `max_retries` failures.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            backoff_factor: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-indexed):
    /// `initial_delay * backoff_factor^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let initial_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let exp = self.backoff_factor.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let delay_ms = (initial_ms * exp).min(max_ms);

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_schedule_doubles_until_cap() {
        let config = RetryConfig::default();
        let delays: Vec<u64> = (0..8)
            .map(|n| config.delay_for_attempt(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 60_000, 60_000]);
    }

    #[test]
    fn constructor_rejects_shrinking_backoff() {
        let ok = RetryConfig::new(5, Duration::from_millis(200), 1.5, Duration::from_secs(10));
        assert!(ok.is_ok());

        let shrinking = RetryConfig::new(5, Duration::from_millis(200), 0.5, Duration::from_secs(10));
        assert!(matches!(shrinking, Err(DomainError::Validation(_))));

        let capped_below = RetryConfig::new(5, Duration::from_secs(2), 2.0, Duration::from_secs(1));
        assert!(matches!(capped_below, Err(DomainError::Validation(_))));
    }

    #[test]
    fn exhaustion_is_inclusive() {
        let config = RetryConfig::default();
        assert!(!config.is_exhausted(2));
        assert!(config.is_exhausted(3));
        assert!(RetryConfig::immediate(0).is_exhausted(0));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn delays_are_monotonic_and_capped(
            initial in 0u64..10_000,
            factor in 1.0f64..4.0,
            cap in 0u64..120_000,
            attempt in 0u32..64,
        ) {
            let config = RetryConfig {
                max_retries: 3,
                initial_delay: Duration::from_millis(initial),
                backoff_factor: factor,
                max_delay: Duration::from_millis(cap),
            };
            let this = config.delay_for_attempt(attempt);
            let next = config.delay_for_attempt(attempt + 1);
            prop_assert!(this <= next);
            prop_assert!(next <= Duration::from_millis(cap));
        }
    }
}
