// Retry backoff policy
//
// Phases: `immediate` failures retry with no delay, then `fixed` failures
// retry after `fixed_delay`, then `backoff` failures retry with an
// exponentially growing delay. Past that the policy answers INFINITE.

use std::time::Duration;

/// Sentinel delay meaning "do not retry"
pub const INFINITE: Duration = Duration::from_secs(1_000_000_000);

/// Longest delay a retry inside the budget can get. Uncapped growth stops here.
pub const MAX_FINITE_DELAY: Duration = Duration::from_secs(999_999_999);

const DEFAULT_FACTOR: f64 = 2.0;

/// Immutable backoff policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub immediate: u32,
    pub fixed: u32,
    pub fixed_delay: Duration,
    pub backoff: u32,
    pub min_delay: Duration,
    /// Zero means uncapped
    pub max_delay: Duration,
    /// Zero means the default factor of 2.0
    pub factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            immediate: 1,
            fixed: 2,
            fixed_delay: Duration::from_secs(10),
            backoff: 8,
            min_delay: Duration::ZERO,
            max_delay: Duration::from_secs(3600),
            factor: DEFAULT_FACTOR,
        }
    }
}

impl Backoff {
    /// Policy that gives up after the first failure
    pub const fn never() -> Self {
        Self {
            immediate: 0,
            fixed: 0,
            fixed_delay: Duration::ZERO,
            backoff: 0,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: DEFAULT_FACTOR,
        }
    }

    pub fn immediate(mut self, n: u32) -> Self {
        self.immediate = n;
        self
    }

    pub fn fixed(mut self, n: u32, delay: Duration) -> Self {
        self.fixed = n;
        self.fixed_delay = delay;
        self
    }

    pub fn exponential(mut self, n: u32, min_delay: Duration, max_delay: Duration) -> Self {
        self.backoff = n;
        self.min_delay = min_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Total number of failures that still get a retry
    pub fn retry_budget(&self) -> u64 {
        self.immediate as u64 + self.fixed as u64 + self.backoff as u64
    }

    /// Delay before the next attempt after `failed_attempts` consecutive failures
    ///
    /// # Panics
    /// If `failed_attempts` is zero.
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        assert!(failed_attempts >= 1, "backoff queried for zero failures");

        let mut r = failed_attempts - 1;
        if r < self.immediate {
            return Duration::ZERO;
        }
        r -= self.immediate;
        if r < self.fixed {
            return self.fixed_delay;
        }
        r -= self.fixed;
        if r >= self.backoff {
            return INFINITE;
        }

        let factor = if self.factor > 0.0 {
            self.factor
        } else {
            DEFAULT_FACTOR
        };
        let max_ms = self.max_delay.as_millis() as f64;
        let capped = |ms: f64| if max_ms > 0.0 && ms > max_ms { max_ms } else { ms };

        let mut ms = if self.min_delay.is_zero() {
            factor * self.fixed_delay.as_millis() as f64
        } else {
            self.min_delay.as_millis() as f64
        };
        ms = capped(ms);
        for _ in 0..r {
            ms = capped(ms * factor);
            if max_ms > 0.0 && ms >= max_ms {
                break;
            }
        }

        // f64::round rounds half away from zero, i.e. half-up for delays
        Duration::from_millis(ms.round() as u64).min(MAX_FINITE_DELAY)
    }
}

/// True if `delay` means "give up"
pub fn is_infinite(delay: Duration) -> bool {
    delay >= INFINITE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(d: Duration) -> Option<u64> {
        if is_infinite(d) {
            None
        } else {
            Some(d.as_secs())
        }
    }

    #[test]
    fn test_backoff_table() {
        let policy = Backoff::never()
            .immediate(1)
            .fixed(2, Duration::from_secs(1))
            .exponential(10, Duration::ZERO, Duration::from_secs(60))
            .factor(2.0);

        let table: Vec<Option<u64>> = (1..=15).map(|n| secs(policy.delay_after(n))).collect();
        let expected = vec![
            Some(0),
            Some(1),
            Some(1),
            Some(2),
            Some(4),
            Some(8),
            Some(16),
            Some(32),
            Some(60),
            Some(60),
            Some(60),
            Some(60),
            Some(60),
            None,
            None,
        ];
        assert_eq!(table, expected);
    }

    #[test]
    fn test_zero_backoff_phase_gives_up_after_fixed() {
        let policy = Backoff::never().fixed(2, Duration::from_secs(5));
        assert_eq!(policy.delay_after(1), Duration::from_secs(5));
        assert_eq!(policy.delay_after(2), Duration::from_secs(5));
        assert_eq!(policy.delay_after(3), INFINITE);
    }

    #[test]
    fn test_never_gives_up_immediately() {
        assert_eq!(Backoff::never().delay_after(1), INFINITE);
    }

    #[test]
    fn test_infinite_iff_past_budget() {
        let policy = Backoff::default();
        let budget = policy.retry_budget() as u32;
        for n in 1..=budget {
            assert!(!is_infinite(policy.delay_after(n)), "n = {n}");
        }
        assert!(is_infinite(policy.delay_after(budget + 1)));
        assert!(is_infinite(policy.delay_after(budget + 7)));
    }

    #[test]
    fn test_exponential_phase_is_monotonic_and_sticks_at_max() {
        let policy = Backoff::never().exponential(
            20,
            Duration::from_millis(300),
            Duration::from_secs(10),
        );
        let delays: Vec<Duration> = (1..=20).map(|n| policy.delay_after(n)).collect();
        assert_eq!(delays[0], Duration::from_millis(300));
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_half_up_rounding() {
        // 1ms * 1.5 = 1.5ms -> 2ms
        let policy = Backoff::never()
            .exponential(3, Duration::from_millis(1), Duration::ZERO)
            .factor(1.5);
        assert_eq!(policy.delay_after(2), Duration::from_millis(2));
    }

    #[test]
    fn test_uncapped_growth_stays_inside_budget() {
        let policy = Backoff::never().exponential(60, Duration::from_secs(1), Duration::ZERO);
        for n in 1..=60 {
            assert!(!is_infinite(policy.delay_after(n)), "n = {n}");
        }
        assert_eq!(policy.delay_after(60), MAX_FINITE_DELAY);
        assert!(is_infinite(policy.delay_after(61)));
    }

    #[test]
    #[should_panic(expected = "zero failures")]
    fn test_zero_failures_is_illegal() {
        Backoff::default().delay_after(0);
    }
}
