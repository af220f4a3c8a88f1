//! Retry policy and registry failure classification.

use std::time::Duration;

use rand::Rng;

use crate::models::ErrorClass;

/// Bounded exponential backoff with optional jitter.
///
/// Attempt 0 runs immediately. The nominal delay before attempt `k >= 1` is
/// `min(max_delay, base_delay × exponential_base^(k-1))`, so the first retry waits
/// `base_delay`, the second `base_delay × exponential_base`, and so on.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter_enabled: bool,
    /// Jitter scales the delay by a factor drawn from `[1 - f, 1 + f]`.
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter_enabled: true,
            jitter_fraction: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy with no delays at all, for tests and manual re-drives.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            exponential_base: 1.0,
            jitter_enabled: false,
            jitter_fraction: 0.0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before `attempt` without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        self.cap(secs)
    }

    /// Delay before `attempt`, with jitter applied when enabled. Never exceeds `max_delay`.
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let nominal = self.base_delay_for(attempt);
        if !self.jitter_enabled || nominal.is_zero() || self.jitter_fraction <= 0.0 {
            return nominal;
        }
        let f = self.jitter_fraction.min(1.0);
        let factor = 1.0 + rng.gen_range(-f..=f);
        self.cap(nominal.as_secs_f64() * factor)
    }

    /// Raise `delay` to a registry-provided `Retry-After` hint, still capped by `max_delay`.
    pub fn apply_hint(&self, delay: Duration, hint: Option<Duration>) -> Duration {
        match hint {
            Some(hint) if hint > delay => hint.min(self.max_delay),
            _ => delay,
        }
    }

    fn cap(&self, secs: f64) -> Duration {
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Map an HTTP status from the registry to an error class.
///
/// Returns `None` for success statuses.
pub fn classify_status(status: u16) -> Option<ErrorClass> {
    match status {
        200..=299 => None,
        401 | 403 => Some(ErrorClass::Authentication),
        408 => Some(ErrorClass::Transient),
        429 => Some(ErrorClass::RateLimited),
        500..=599 => Some(ErrorClass::Transient),
        // Remaining 4xx (400, 404, 409, 422, ...) mean the document itself is unacceptable.
        400..=499 => Some(ErrorClass::Validation),
        // Redirects and informational statuses are unexpected from a JSON API.
        _ => Some(ErrorClass::Transient),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter_enabled: false,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_first_attempt_is_immediate() {
        assert_eq!(no_jitter().base_delay_for(0), Duration::ZERO);
    }

    #[test]
    fn test_backoff_doubles_from_base() {
        let policy = no_jitter();
        assert_eq!(policy.base_delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(5),
            ..no_jitter()
        };
        assert_eq!(policy.base_delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.base_delay_for(200), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_fraction_and_cap() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=8 {
            let nominal = policy.base_delay_for(attempt).as_secs_f64();
            for _ in 0..50 {
                let d = policy.delay_for(attempt, &mut rng).as_secs_f64();
                assert!(d >= nominal * 0.9 - 1e-9, "{} < {}", d, nominal * 0.9);
                assert!(d <= (nominal * 1.1).min(60.0) + 1e-9);
            }
        }
    }

    #[test]
    fn test_retry_after_hint_is_lower_bound() {
        let policy = no_jitter();
        let d = policy.apply_hint(Duration::from_secs(1), Some(Duration::from_secs(10)));
        assert_eq!(d, Duration::from_secs(10));
        let d = policy.apply_hint(Duration::from_secs(4), Some(Duration::from_secs(2)));
        assert_eq!(d, Duration::from_secs(4));
        let d = policy.apply_hint(Duration::from_secs(1), Some(Duration::from_secs(600)));
        assert_eq!(d, Duration::from_secs(60));
    }

    #[test]
    fn test_max_attempts() {
        assert_eq!(RetryPolicy::default().max_attempts(), 4);
        assert_eq!(RetryPolicy::immediate(0).max_attempts(), 1);
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(201), None);
        assert_eq!(classify_status(400), Some(ErrorClass::Validation));
        assert_eq!(classify_status(422), Some(ErrorClass::Validation));
        assert_eq!(classify_status(401), Some(ErrorClass::Authentication));
        assert_eq!(classify_status(403), Some(ErrorClass::Authentication));
        assert_eq!(classify_status(408), Some(ErrorClass::Transient));
        assert_eq!(classify_status(429), Some(ErrorClass::RateLimited));
        assert_eq!(classify_status(503), Some(ErrorClass::Transient));
    }
}
