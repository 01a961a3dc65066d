// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff policy of the automatic reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectOptions {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl ReconnectOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive options with `max_attempts` connect retries.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Derive options with the first-retry delay set to `base_delay`.
    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Derive options capping every delay at `max_delay`.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Derive options spreading delays by the `jitter` fraction,
    /// clamped to `0.0..=1.0`.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Deterministic part of the backoff:
    /// `min(max_delay, base_delay * 2^(attempt - 1))` for attempts
    /// counted from 1.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let exponential = self
            .base_delay
            .saturating_mul(1_u32.checked_shl(shift).unwrap_or(u32::MAX));
        exponential.min(self.max_delay)
    }

    /// Backoff delay with the jitter factor applied:
    /// `delay * (1 + uniform(-jitter, +jitter))`.
    #[must_use]
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter <= f64::EPSILON {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64(factor.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let options = ReconnectOptions::new()
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(30));
        assert_eq!(options.delay(1), Duration::from_secs(1));
        assert_eq!(options.delay(2), Duration::from_secs(2));
        assert_eq!(options.delay(3), Duration::from_secs(4));
        assert_eq!(options.delay(5), Duration::from_secs(16));
        assert_eq!(options.delay(6), Duration::from_secs(30));
        assert_eq!(options.delay(20), Duration::from_secs(30));
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let options = ReconnectOptions::new();
        assert_eq!(options.delay(1000), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let options = ReconnectOptions::new()
            .with_base_delay(Duration::from_secs(4))
            .with_jitter(0.5);
        for _ in 0..100 {
            let delay = options.delay_with_jitter(1);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(6));
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let options = ReconnectOptions::new().with_jitter(0.0);
        assert_eq!(options.delay_with_jitter(3), options.delay(3));
    }
}
