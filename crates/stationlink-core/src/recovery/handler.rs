//! ErrorHandler - 報告されたエラーに対する回復アクションの決定
//!
//! # フロー
//! 1. ルール `(condition, action)` を順に評価し、最初に一致したものを採用
//! 2. 一致しなければ重大度で決める（Critical/High → Escalate, Medium → Retry, それ以外 → Skip）
//! 3. Retry / CircuitBreaker は名前で登録された戦略に委譲する
//!    - Retry: 成功 → Retry、失敗 → Escalate
//!    - CircuitBreaker: 成功 → Retry、拒否 → Skip
//!    - 戦略が未登録なら Skip
//! 4. Escalate は ERROR で記録してカウント
//!
//! Retry / Fallback になったエラーは `active_errors` に残り、`resolve()` で回復扱いになる。
//! Escalate / Skip になったエラーはその場で破棄する。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::RecoveryConfig;
use crate::domain::{ErrorAction, ErrorContext, ErrorId, ErrorSeverity, ErrorType};
use crate::error::RecoveryError;
use crate::observability::Observer;
use crate::ports::Clock;
use crate::recovery::circuit_breaker::{CIRCUIT_BREAKER_STRATEGY, CircuitBreakerStrategy};
use crate::recovery::retry::{RETRY_STRATEGY, RetryStrategy};
use crate::recovery::strategy::{RecoveryStrategy, StrategyStats};

pub type ErrorCondition = Box<dyn Fn(&ErrorContext) -> bool + Send + Sync>;

/// `action` applies to every error matching `condition`.
pub struct ErrorRule {
    pub action: ErrorAction,
    condition: ErrorCondition,
}

impl ErrorRule {
    pub fn new(action: ErrorAction, condition: impl Fn(&ErrorContext) -> bool + Send + Sync + 'static) -> Self {
        Self {
            action,
            condition: Box::new(condition),
        }
    }

    pub fn for_type(error_type: ErrorType, action: ErrorAction) -> Self {
        Self::new(action, move |ctx| ctx.error_type == error_type)
    }

    pub fn matches(&self, ctx: &ErrorContext) -> bool {
        (self.condition)(ctx)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorHandlerStatistics {
    pub total_errors: u64,
    pub recovered_errors: u64,
    pub escalated_errors: u64,
    pub skipped_errors: u64,
    pub active_errors: usize,
    pub total_strategies: usize,
    pub strategy_stats: BTreeMap<String, StrategyStats>,
}

pub struct ErrorHandler {
    rules: Vec<ErrorRule>,
    strategies: HashMap<String, Arc<dyn RecoveryStrategy>>,
    active_errors: Mutex<HashMap<ErrorId, ErrorContext>>,
    total: AtomicU64,
    recovered: AtomicU64,
    escalated: AtomicU64,
    skipped: AtomicU64,
    observer: Observer,
}

impl ErrorHandler {
    /// Handler with no rules and no strategies.
    pub fn new(observer: Observer) -> Self {
        Self {
            rules: Vec::new(),
            strategies: HashMap::new(),
            active_errors: Mutex::new(HashMap::new()),
            total: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
            escalated: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            observer,
        }
    }

    /// Retry + circuit breaker strategies, and network errors routed to the breaker.
    pub fn with_defaults(config: &RecoveryConfig, clock: Arc<dyn Clock>, observer: Observer) -> Self {
        let mut handler = Self::new(observer);
        handler.register_strategy(Arc::new(RetryStrategy::new(
            config.retry_max_retries,
            config.retry_backoff_factor,
            Arc::clone(&clock),
        )));
        handler.register_strategy(Arc::new(CircuitBreakerStrategy::new(
            config.breaker_failure_threshold,
            config.breaker_recovery_timeout(),
            clock,
        )));
        handler.add_rule(ErrorRule::for_type(ErrorType::Network, ErrorAction::CircuitBreaker));
        handler
    }

    /// Register (or replace) a strategy under its name.
    pub fn register_strategy(&mut self, strategy: Arc<dyn RecoveryStrategy>) {
        let name = strategy.name().to_string();
        self.observer.in_scope(|| info!(strategy = %name, "registered recovery strategy"));
        self.strategies.insert(name, strategy);
    }

    pub fn add_rule(&mut self, rule: ErrorRule) {
        self.rules.push(rule);
    }

    pub fn strategy(&self, name: &str) -> Option<&Arc<dyn RecoveryStrategy>> {
        self.strategies.get(name)
    }

    /// Decide and carry out the recovery action for `ctx`.
    pub fn handle_error(&self, ctx: &mut ErrorContext) -> ErrorAction {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.observer.in_scope(|| {
            warn!(
                error_id = %ctx.error_id,
                severity = %ctx.severity,
                error_type = %ctx.error_type,
                message = %ctx.message,
                "handling error"
            );
        });

        let action = match self.determine_action(ctx) {
            ErrorAction::Retry => self.handle_retry(ctx),
            ErrorAction::CircuitBreaker => self.handle_circuit_breaker(ctx),
            ErrorAction::Escalate => ErrorAction::Escalate,
            other => other,
        };

        match action {
            ErrorAction::Escalate => {
                self.escalated.fetch_add(1, Ordering::Relaxed);
                self.observer.in_scope(|| {
                    error!(
                        error_id = %ctx.error_id,
                        severity = %ctx.severity,
                        message = %ctx.message,
                        retry_count = ctx.retry_count,
                        "ESCALATING error"
                    );
                });
                self.active_errors.lock().remove(&ctx.error_id);
            }
            ErrorAction::Skip => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                self.observer.in_scope(|| info!(error_id = %ctx.error_id, "error skipped"));
                self.active_errors.lock().remove(&ctx.error_id);
            }
            ErrorAction::Retry | ErrorAction::Fallback | ErrorAction::CircuitBreaker => {
                self.active_errors.lock().insert(ctx.error_id, ctx.clone());
            }
        }
        action
    }

    fn determine_action(&self, ctx: &ErrorContext) -> ErrorAction {
        if let Some(rule) = self.rules.iter().find(|rule| rule.matches(ctx)) {
            return rule.action;
        }
        match ctx.severity {
            ErrorSeverity::Critical | ErrorSeverity::High => ErrorAction::Escalate,
            ErrorSeverity::Medium => ErrorAction::Retry,
            ErrorSeverity::Low | ErrorSeverity::Info => ErrorAction::Skip,
        }
    }

    fn handle_retry(&self, ctx: &mut ErrorContext) -> ErrorAction {
        let Some(strategy) = self.strategies.get(RETRY_STRATEGY) else {
            self.observer.in_scope(|| error!("no retry strategy registered"));
            return ErrorAction::Skip;
        };
        if strategy.attempt_recovery(ctx) {
            self.observer.in_scope(|| {
                info!(error_id = %ctx.error_id, next_retry_time = ?ctx.next_retry_time, "retry scheduled");
            });
            ErrorAction::Retry
        } else {
            self.observer.in_scope(|| warn!(error_id = %ctx.error_id, "max retries exceeded"));
            ErrorAction::Escalate
        }
    }

    fn handle_circuit_breaker(&self, ctx: &mut ErrorContext) -> ErrorAction {
        let Some(strategy) = self.strategies.get(CIRCUIT_BREAKER_STRATEGY) else {
            self.observer.in_scope(|| error!("no circuit breaker strategy registered"));
            return ErrorAction::Skip;
        };
        if strategy.attempt_recovery(ctx) {
            self.observer.in_scope(|| info!(error_id = %ctx.error_id, "circuit breaker allows retry"));
            ErrorAction::Retry
        } else {
            self.observer.in_scope(|| warn!(error_id = %ctx.error_id, "circuit breaker open"));
            ErrorAction::Skip
        }
    }

    /// Mark an active error as recovered.
    pub fn resolve(&self, error_id: ErrorId) -> Result<ErrorContext, RecoveryError> {
        let ctx = self
            .active_errors
            .lock()
            .remove(&error_id)
            .ok_or(RecoveryError::UnknownError(error_id))?;
        self.recovered.fetch_add(1, Ordering::Relaxed);
        self.observer.in_scope(|| info!(error_id = %error_id, "error recovered"));
        Ok(ctx)
    }

    /// Forget an active error without counting it as recovered.
    pub fn discard(&self, error_id: ErrorId) -> Option<ErrorContext> {
        self.active_errors.lock().remove(&error_id)
    }

    pub fn active_error(&self, error_id: ErrorId) -> Option<ErrorContext> {
        self.active_errors.lock().get(&error_id).cloned()
    }

    pub fn statistics(&self) -> ErrorHandlerStatistics {
        let strategy_stats = self
            .strategies
            .iter()
            .map(|(name, strategy)| (name.clone(), strategy.stats()))
            .collect();
        ErrorHandlerStatistics {
            total_errors: self.total.load(Ordering::Relaxed),
            recovered_errors: self.recovered.load(Ordering::Relaxed),
            escalated_errors: self.escalated.load(Ordering::Relaxed),
            skipped_errors: self.skipped.load(Ordering::Relaxed),
            active_errors: self.active_errors.lock().len(),
            total_strategies: self.strategies.len(),
            strategy_stats,
        }
    }
}
