use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff with full jitter for remote writes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(8), 3)
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another try is allowed after `attempt` (zero-based) failed.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis();
        let ceiling = u64::try_from(ceiling).unwrap_or(u64::MAX);
        Duration::from_millis(rng.gen_range(0..=ceiling))
    }

    fn ceiling(&self, attempt: u32) -> Duration {
        self.base
            .checked_mul(1u32 << attempt.min(16))
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn ceiling_doubles_until_capped() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(350), 3);
        assert_eq!(policy.ceiling(0), Duration::from_millis(100));
        assert_eq!(policy.ceiling(1), Duration::from_millis(200));
        assert_eq!(policy.ceiling(2), Duration::from_millis(350));
        assert_eq!(policy.ceiling(40), Duration::from_millis(350));
    }

    #[test]
    fn jittered_delay_stays_under_ceiling() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..6 {
            assert!(policy.delay_with_rng(attempt, &mut rng) <= policy.ceiling(attempt));
        }
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry_after(0));
        assert!(policy.allows_retry_after(1));
        assert!(!policy.allows_retry_after(2));
        assert_eq!(RetryPolicy::new(Duration::ZERO, Duration::ZERO, 0).max_attempts(), 1);
    }
}
