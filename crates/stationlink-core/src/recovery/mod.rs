//! Error & recovery engine.

pub mod circuit_breaker;
pub mod handler;
pub mod priority;
pub mod retry;
pub mod strategy;

pub use circuit_breaker::{BreakerState, CIRCUIT_BREAKER_STRATEGY, CircuitBreakerStrategy};
pub use handler::{ErrorCondition, ErrorHandler, ErrorHandlerStatistics, ErrorRule};
pub use priority::{PriorityManager, PriorityRule};
pub use retry::{RETRY_STRATEGY, RetryStrategy};
pub use strategy::{RecoveryStrategy, StrategyStats};
