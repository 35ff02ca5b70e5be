//! Retry strategy: bounded retries with exponential backoff.

use std::sync::Arc;

use crate::domain::ErrorContext;
use crate::ports::Clock;
use crate::recovery::strategy::{OutcomeCounters, RecoveryStrategy, StrategyStats};

pub const RETRY_STRATEGY: &str = "retry";

/// Schedules another attempt while the context still has retry budget.
///
/// Each successful call consumes one retry from the context and moves
/// `next_retry_time` to `now + backoff_factor ^ retry_count` seconds.
///
/// Example with backoff_factor=2.0:
/// - retry 1: +2s
/// - retry 2: +4s
/// - retry 3: +8s
pub struct RetryStrategy {
    max_retries: u32,
    backoff_factor: f64,
    clock: Arc<dyn Clock>,
    counters: OutcomeCounters,
}

impl RetryStrategy {
    pub fn new(max_retries: u32, backoff_factor: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_retries,
            backoff_factor,
            clock,
            counters: OutcomeCounters::default(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }
}

impl RecoveryStrategy for RetryStrategy {
    fn name(&self) -> &str {
        RETRY_STRATEGY
    }

    fn attempt_recovery(&self, ctx: &mut ErrorContext) -> bool {
        // 予算切れは試行にカウントしない
        if !ctx.can_retry() {
            return false;
        }
        ctx.backoff_factor = self.backoff_factor;
        if ctx.increment_retry(self.clock.now()).is_err() {
            return false;
        }
        self.counters.record(ctx.retry_count <= self.max_retries)
    }

    fn stats(&self) -> StrategyStats {
        self.counters.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ErrorId, ErrorSeverity, ErrorType};
    use crate::ports::FixedClock;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use ulid::Ulid;

    fn setup() -> (Arc<FixedClock>, ErrorContext) {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0));
        let ctx = ErrorContext::new(
            ErrorId::from_ulid(Ulid::new()),
            t0,
            ErrorSeverity::Medium,
            ErrorType::Timeout,
            "no ack",
        );
        (clock, ctx)
    }

    #[test]
    fn fourth_call_with_three_retries_fails() {
        let (clock, mut ctx) = setup();
        let strategy = RetryStrategy::new(3, 2.0, clock);

        let results: Vec<bool> = (0..4).map(|_| strategy.attempt_recovery(&mut ctx)).collect();

        assert_eq!(results, vec![true, true, true, false]);
        assert_eq!(ctx.retry_count, 3);
        assert_eq!(strategy.stats().success_count, 3);
    }

    #[test]
    fn exponential_backoff_increases() {
        let (clock, mut ctx) = setup();
        let t0 = clock.now();
        let strategy = RetryStrategy::new(3, 2.0, clock);

        strategy.attempt_recovery(&mut ctx);
        assert_eq!(ctx.next_retry_time, Some(t0 + ChronoDuration::seconds(2)));
        strategy.attempt_recovery(&mut ctx);
        assert_eq!(ctx.next_retry_time, Some(t0 + ChronoDuration::seconds(4)));
        strategy.attempt_recovery(&mut ctx);
        assert_eq!(ctx.next_retry_time, Some(t0 + ChronoDuration::seconds(8)));
    }

    #[test]
    fn strategy_budget_below_context_budget_counts_failures() {
        let (clock, ctx) = setup();
        let mut ctx = ctx.with_retry_budget(0, 5);
        let strategy = RetryStrategy::new(1, 2.0, clock);

        assert!(strategy.attempt_recovery(&mut ctx));
        assert!(!strategy.attempt_recovery(&mut ctx));
        let stats = strategy.stats();
        assert_eq!((stats.success_count, stats.failure_count), (1, 1));
    }
}
