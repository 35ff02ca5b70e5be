//! Errors - 報告されたエラーの分類とリトライ予算
//!
//! # 分類
//! - Network / Timeout: 配送の失敗
//! - Protocol / Validation: 契約違反
//! - Authentication: アクセス失敗
//! - Resource: 容量不足
//! - Unknown: その他
//!
//! `ErrorContext` は 1 回のエラー発生を表し、リカバリ戦略が
//! `retry_count` / `next_retry_time` を更新する。

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ParseEnumError;
use crate::domain::ids::ErrorId;
use crate::error::RecoveryError;

pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// How bad an error is. Lower value = more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Critical = 1,
    High = 2,
    Medium = 3,
    Low = 4,
    Info = 5,
}

impl ErrorSeverity {
    pub const ALL: [ErrorSeverity; 5] = [
        ErrorSeverity::Critical,
        ErrorSeverity::High,
        ErrorSeverity::Medium,
        ErrorSeverity::Low,
        ErrorSeverity::Info,
    ];

    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn from_value(value: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| i64::from(s.value()) == value)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorSeverity::Critical => "critical",
            ErrorSeverity::High => "high",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::Low => "low",
            ErrorSeverity::Info => "info",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    #[serde(rename = "network_error")]
    Network,
    #[serde(rename = "timeout_error")]
    Timeout,
    #[serde(rename = "protocol_error")]
    Protocol,
    #[serde(rename = "validation_error")]
    Validation,
    #[serde(rename = "authentication_error")]
    Authentication,
    #[serde(rename = "resource_error")]
    Resource,
    #[serde(rename = "unknown_error")]
    Unknown,
}

impl ErrorType {
    pub const ALL: [ErrorType; 7] = [
        ErrorType::Network,
        ErrorType::Timeout,
        ErrorType::Protocol,
        ErrorType::Validation,
        ErrorType::Authentication,
        ErrorType::Resource,
        ErrorType::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::Network => "network_error",
            ErrorType::Timeout => "timeout_error",
            ErrorType::Protocol => "protocol_error",
            ErrorType::Validation => "validation_error",
            ErrorType::Authentication => "authentication_error",
            ErrorType::Resource => "resource_error",
            ErrorType::Unknown => "unknown_error",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("error type", s))
    }
}

/// Recovery decision for a reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    Retry,
    Skip,
    Escalate,
    CircuitBreaker,
    Fallback,
}

impl ErrorAction {
    pub const ALL: [ErrorAction; 5] = [
        ErrorAction::Retry,
        ErrorAction::Skip,
        ErrorAction::Escalate,
        ErrorAction::CircuitBreaker,
        ErrorAction::Fallback,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorAction::Retry => "retry",
            ErrorAction::Skip => "skip",
            ErrorAction::Escalate => "escalate",
            ErrorAction::CircuitBreaker => "circuit_breaker",
            ErrorAction::Fallback => "fallback",
        }
    }
}

impl fmt::Display for ErrorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorAction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("error action", s))
    }
}

/// One error occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub error_id: ErrorId,
    pub timestamp: DateTime<Utc>,
    pub severity: ErrorSeverity,
    pub error_type: ErrorType,
    pub message: String,
    pub details: HashMap<String, serde_json::Value>,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub next_retry_time: Option<DateTime<Utc>>,
}

impl ErrorContext {
    pub fn new(
        error_id: ErrorId,
        timestamp: DateTime<Utc>,
        severity: ErrorSeverity,
        error_type: ErrorType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error_id,
            timestamp,
            severity,
            error_type,
            message: message.into(),
            details: HashMap::new(),
            session_id: None,
            agent_id: None,
            retry_count: 0,
            max_retries: crate::domain::task::DEFAULT_MAX_RETRIES,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            next_retry_time: None,
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_retry_budget(mut self, retry_count: u32, max_retries: u32) -> Self {
        self.retry_count = retry_count;
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = backoff_factor;
        self
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// `now + backoff_factor ^ retry_count` seconds.
    pub fn calculate_next_retry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + backoff_delay(self.backoff_factor, self.retry_count)
    }

    /// Consume one retry and reschedule.
    ///
    /// Fails without touching the context once the budget is spent.
    pub fn increment_retry(&mut self, now: DateTime<Utc>) -> Result<(), RecoveryError> {
        if !self.can_retry() {
            return Err(RecoveryError::RetryBudgetExhausted {
                error_id: self.error_id,
                retry_count: self.retry_count,
                max_retries: self.max_retries,
            });
        }
        self.retry_count += 1;
        self.next_retry_time = Some(self.calculate_next_retry(now));
        Ok(())
    }
}

/// Exponential backoff: `factor ^ exponent` seconds, saturating at one day.
pub fn backoff_delay(factor: f64, exponent: u32) -> ChronoDuration {
    const MAX_MILLIS: f64 = 86_400_000.0;
    let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
    let millis = (factor.powi(exponent) * 1000.0).clamp(0.0, MAX_MILLIS);
    ChronoDuration::milliseconds(millis as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn ctx() -> ErrorContext {
        ErrorContext::new(
            ErrorId::from_ulid(Ulid::new()),
            t0(),
            ErrorSeverity::Medium,
            ErrorType::Network,
            "connection refused",
        )
    }

    #[test]
    fn can_retry_tracks_budget() {
        let mut c = ctx().with_retry_budget(0, 2);
        assert!(c.can_retry());
        c.increment_retry(t0()).unwrap();
        assert!(c.can_retry());
        c.increment_retry(t0()).unwrap();
        assert!(!c.can_retry());
    }

    #[test]
    fn increment_beyond_budget_fails_and_leaves_context_unchanged() {
        let mut c = ctx().with_retry_budget(3, 3);
        let before = c.clone();
        let err = c.increment_retry(t0()).unwrap_err();
        assert!(matches!(err, RecoveryError::RetryBudgetExhausted { retry_count: 3, .. }));
        assert_eq!(c, before);
    }

    #[test]
    fn next_retry_uses_exponential_backoff() {
        let mut c = ctx();
        c.increment_retry(t0()).unwrap();
        assert_eq!(c.next_retry_time, Some(t0() + ChronoDuration::seconds(2)));
        c.increment_retry(t0()).unwrap();
        assert_eq!(c.next_retry_time, Some(t0() + ChronoDuration::seconds(4)));
        c.increment_retry(t0()).unwrap();
        assert_eq!(c.next_retry_time, Some(t0() + ChronoDuration::seconds(8)));
    }

    #[test]
    fn backoff_saturates() {
        assert_eq!(backoff_delay(2.0, 0), ChronoDuration::seconds(1));
        assert_eq!(backoff_delay(10.0, 40), ChronoDuration::days(1));
    }

    #[test]
    fn error_type_wire_names() {
        assert_eq!(
            serde_json::to_value(ErrorType::Network).unwrap(),
            serde_json::json!("network_error")
        );
        for t in ErrorType::ALL {
            assert_eq!(t.as_str().parse::<ErrorType>().unwrap(), t);
        }
    }

    #[test]
    fn severity_values() {
        assert_eq!(ErrorSeverity::Critical.value(), 1);
        assert_eq!(ErrorSeverity::from_value(5), Some(ErrorSeverity::Info));
        assert_eq!(ErrorSeverity::from_value(0), None);
    }
}
