use std::time::Duration;

use rand::RngCore;
use tokio::time::Instant;

/// Exponential retry schedule. Waits start at `first` and double per
/// failure up to `ceiling`; each wait gains up to `jitter_percent` of itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub first: Duration,
    pub ceiling: Duration,
    pub jitter_percent: u8,
    /// Attempts per run, counting the first; `None` never gives up.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            ceiling: Duration::from_secs(30),
            jitter_percent: 25,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep `delay`, then make attempt number `attempt`.
    Wait { delay: Duration, attempt: u32 },
    Exhausted { attempts: u32 },
    /// The wait would end at or past the deadline.
    OutOfTime,
}

/// Failure counter for one policy. `restart` begins a new run.
#[derive(Debug)]
pub struct Retry<R> {
    policy: RetryPolicy,
    failures: u32,
    rng: R,
}

impl<R: RngCore> Retry<R> {
    pub fn new(policy: RetryPolicy, rng: R) -> Self {
        Self {
            policy,
            failures: 0,
            rng,
        }
    }

    pub fn restart(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records a failure and returns the wait before the next try, ignoring
    /// the attempt limit.
    pub fn failure_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let doublings = (self.failures - 1).min(31);
        let step = self
            .policy
            .first
            .saturating_mul(1 << doublings)
            .min(self.policy.ceiling);
        let spread = step.saturating_mul(u32::from(self.policy.jitter_percent.min(100))) / 100;
        let spread_ns = u64::try_from(spread.as_nanos()).unwrap_or(u64::MAX);
        let jitter = match spread_ns {
            0 => Duration::ZERO,
            n => Duration::from_nanos(self.rng.next_u64() % n.saturating_add(1)),
        };
        step.saturating_add(jitter).min(self.policy.ceiling)
    }

    /// Records a failure at `now` and decides whether another attempt fits
    /// the attempt limit and `deadline`.
    pub fn after_failure(&mut self, now: Instant, deadline: Option<Instant>) -> RetryDecision {
        let delay = self.failure_delay();
        let failures = self.failures;
        if self
            .policy
            .max_attempts
            .is_some_and(|max| failures >= max.max(1))
        {
            return RetryDecision::Exhausted { attempts: failures };
        }
        if deadline.is_some_and(|deadline| now + delay >= deadline) {
            return RetryDecision::OutOfTime;
        }
        RetryDecision::Wait {
            delay,
            attempt: failures + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn steady(max_attempts: Option<u32>) -> Retry<StdRng> {
        let policy = RetryPolicy {
            first: Duration::from_millis(100),
            ceiling: Duration::from_millis(350),
            jitter_percent: 0,
            max_attempts,
        };
        Retry::new(policy, StdRng::seed_from_u64(11))
    }

    #[test]
    fn waits_double_until_the_ceiling() {
        let mut retry = steady(None);
        let waits: Vec<u128> = (0..5).map(|_| retry.failure_delay().as_millis()).collect();
        assert_eq!(waits, vec![100, 200, 350, 350, 350]);

        retry.restart();
        assert_eq!(retry.failures(), 0);
        assert_eq!(retry.failure_delay(), Duration::from_millis(100));
    }

    #[test]
    fn attempt_limit_counts_the_first_try() {
        let now = Instant::now();
        let mut retry = steady(Some(3));
        assert_eq!(
            retry.after_failure(now, None),
            RetryDecision::Wait {
                delay: Duration::from_millis(100),
                attempt: 2
            }
        );
        assert!(matches!(
            retry.after_failure(now, None),
            RetryDecision::Wait { attempt: 3, .. }
        ));
        assert_eq!(
            retry.after_failure(now, None),
            RetryDecision::Exhausted { attempts: 3 }
        );

        let mut single = steady(Some(0));
        assert_eq!(
            single.after_failure(now, None),
            RetryDecision::Exhausted { attempts: 1 }
        );
    }

    #[test]
    fn wait_reaching_the_deadline_gives_up() {
        let now = Instant::now();
        let mut retry = steady(None);
        assert!(matches!(
            retry.after_failure(now, Some(now + Duration::from_millis(101))),
            RetryDecision::Wait { .. }
        ));
        // second wait is 200ms; a deadline exactly there is already too late
        assert_eq!(
            retry.after_failure(now, Some(now + Duration::from_millis(200))),
            RetryDecision::OutOfTime
        );
    }

    #[test]
    fn jitter_stays_within_percent_and_ceiling() {
        let policy = RetryPolicy {
            first: Duration::from_secs(1),
            ceiling: Duration::from_secs(3),
            jitter_percent: 25,
            max_attempts: None,
        };
        let mut a = Retry::new(policy, StdRng::seed_from_u64(5));
        let mut b = Retry::new(policy, StdRng::seed_from_u64(5));
        for (low, high) in [(1_000, 1_250), (2_000, 2_500), (3_000, 3_000)] {
            let wait = a.failure_delay();
            assert!(wait >= Duration::from_millis(low), "{wait:?}");
            assert!(wait <= Duration::from_millis(high), "{wait:?}");
            assert_eq!(wait, b.failure_delay());
        }
    }
}
