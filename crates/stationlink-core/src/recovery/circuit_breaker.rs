//! Circuit breaker strategy.
//!
//! ```text
//! closed --(failures >= threshold)--> open
//! open   --(recovery_timeout elapsed)--> half_open
//! half_open --(probe ok)--> closed
//! half_open --(probe fails)--> open
//! ```
//!
//! While `open` and inside the cool-down, attempts are refused without
//! touching any counter.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::domain::ErrorContext;
use crate::ports::Clock;
use crate::recovery::strategy::{OutcomeCounters, RecoveryStrategy, StrategyStats};

pub const CIRCUIT_BREAKER_STRATEGY: &str = "circuit_breaker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_time: Option<DateTime<Utc>>,
}

pub struct CircuitBreakerStrategy {
    failure_threshold: u32,
    recovery_timeout: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
    counters: OutcomeCounters,
}

impl CircuitBreakerStrategy {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            clock,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_time: None,
            }),
            counters: OutcomeCounters::default(),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    fn cooled_down(&self, last_failure: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(last_failure) = last_failure else {
            return true;
        };
        match now.signed_duration_since(last_failure).to_std() {
            Ok(elapsed) => elapsed > self.recovery_timeout,
            Err(_) => false,
        }
    }
}

impl RecoveryStrategy for CircuitBreakerStrategy {
    fn name(&self) -> &str {
        CIRCUIT_BREAKER_STRATEGY
    }

    fn attempt_recovery(&self, ctx: &mut ErrorContext) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        if inner.state == BreakerState::Open {
            if !self.cooled_down(inner.last_failure_time, now) {
                return false;
            }
            inner.state = BreakerState::HalfOpen;
        }

        // 残りのリトライ予算があればプローブ成功とみなす
        let success = ctx.can_retry();
        if success {
            inner.state = BreakerState::Closed;
            inner.consecutive_failures = 0;
        } else {
            inner.consecutive_failures += 1;
            inner.last_failure_time = Some(now);
            if inner.consecutive_failures >= self.failure_threshold {
                inner.state = BreakerState::Open;
            }
        }
        self.counters.record(success)
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
    use chrono::{Duration as ChronoDuration, TimeZone};
    use ulid::Ulid;

    fn ctx(retry_count: u32) -> ErrorContext {
        ErrorContext::new(
            ErrorId::from_ulid(Ulid::new()),
            Utc::now(),
            ErrorSeverity::Medium,
            ErrorType::Network,
            "unreachable",
        )
        .with_retry_budget(retry_count, 3)
    }

    fn breaker(threshold: u32, timeout_secs: u64) -> (Arc<FixedClock>, CircuitBreakerStrategy) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let cb = CircuitBreakerStrategy::new(threshold, Duration::from_secs(timeout_secs), clock.clone());
        (clock, cb)
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let (_clock, cb) = breaker(3, 60);
        for _ in 0..2 {
            assert!(!cb.attempt_recovery(&mut ctx(3)));
            assert_eq!(cb.state(), BreakerState::Closed);
        }
        assert!(!cb.attempt_recovery(&mut ctx(3)));
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn success_resets_failure_streak() {
        let (_clock, cb) = breaker(3, 60);
        cb.attempt_recovery(&mut ctx(3));
        cb.attempt_recovery(&mut ctx(3));
        assert!(cb.attempt_recovery(&mut ctx(0)));
        assert_eq!(cb.consecutive_failures(), 0);
        cb.attempt_recovery(&mut ctx(3));
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn open_refuses_without_touching_counters() {
        let (clock, cb) = breaker(2, 60);
        cb.attempt_recovery(&mut ctx(3));
        cb.attempt_recovery(&mut ctx(3));
        assert_eq!(cb.state(), BreakerState::Open);
        let before = (cb.stats(), cb.consecutive_failures());

        clock.advance(ChronoDuration::seconds(30));
        assert!(!cb.attempt_recovery(&mut ctx(0)));
        assert!(!cb.attempt_recovery(&mut ctx(0)));

        assert_eq!((cb.stats(), cb.consecutive_failures()), before);
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn one_good_probe_after_timeout_closes() {
        let (clock, cb) = breaker(2, 60);
        cb.attempt_recovery(&mut ctx(3));
        cb.attempt_recovery(&mut ctx(3));

        clock.advance(ChronoDuration::seconds(61));
        assert!(cb.attempt_recovery(&mut ctx(0)));
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[test]
    fn failed_probe_reopens() {
        let (clock, cb) = breaker(2, 60);
        cb.attempt_recovery(&mut ctx(3));
        cb.attempt_recovery(&mut ctx(3));

        clock.advance(ChronoDuration::seconds(61));
        assert!(!cb.attempt_recovery(&mut ctx(3)));
        assert_eq!(cb.state(), BreakerState::Open);

        // 新しい失敗時刻から再びクールダウン
        clock.advance(ChronoDuration::seconds(30));
        assert!(!cb.attempt_recovery(&mut ctx(0)));
        assert_eq!(cb.state(), BreakerState::Open);
    }
}
