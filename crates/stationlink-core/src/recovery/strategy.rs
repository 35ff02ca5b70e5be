//! RecoveryStrategy - 回復戦略の共通インターフェース

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::domain::ErrorContext;

/// A named recovery policy the error handler delegates to.
///
/// `attempt_recovery` may mutate the context (retry counters, next retry time).
/// Strategies keep their own state behind interior mutability so one instance
/// can be shared by every caller.
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn attempt_recovery(&self, ctx: &mut ErrorContext) -> bool;

    fn stats(&self) -> StrategyStats;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StrategyStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
}

impl StrategyStats {
    pub fn new(success_count: u64, failure_count: u64) -> Self {
        let total = success_count + failure_count;
        let success_rate = if total == 0 {
            0.0
        } else {
            success_count as f64 / total as f64
        };
        Self {
            success_count,
            failure_count,
            success_rate,
        }
    }
}

/// Cumulative success / failure counters shared by the built-in strategies.
#[derive(Debug, Default)]
pub(crate) struct OutcomeCounters {
    success: AtomicU64,
    failure: AtomicU64,
}

impl OutcomeCounters {
    pub(crate) fn record(&self, success: bool) -> bool {
        if success {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure.fetch_add(1, Ordering::Relaxed);
        }
        success
    }

    pub(crate) fn stats(&self) -> StrategyStats {
        StrategyStats::new(
            self.success.load(Ordering::Relaxed),
            self.failure.load(Ordering::Relaxed),
        )
    }
}
