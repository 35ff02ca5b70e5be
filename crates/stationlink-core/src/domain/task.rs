//! MessageTask - 送信待ちの 1 単位
//!
//! # 順序
//! `(priority, timestamp, sequence)` の辞書順で全順序。
//! `sequence` はキュー投入時の単調カウンタで、timestamp が衝突しても
//! 投入順 (FIFO) を保つための最終タイブレーク。
//!
//! BinaryHeap は max-heap なので、キュー側で `Reverse` に包んで使う。

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ids::{ErrorId, TaskId};
use crate::domain::message::OutboundMessage;
use crate::domain::priority::MessagePriority;

pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Terminal status handed to a task's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invoked exactly once when a task reaches a terminal status.
pub type DeliveryCallback = Box<dyn FnOnce(&OutboundMessage, DeliveryStatus) + Send>;

/// How a failed task's priority changes when it is requeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryEscalation {
    /// Keep the original priority.
    Keep,
    /// Promote to at least this priority. A more urgent task is never demoted.
    PromoteTo(MessagePriority),
}

impl RetryEscalation {
    pub fn apply(self, current: MessagePriority) -> MessagePriority {
        match self {
            RetryEscalation::Keep => current,
            RetryEscalation::PromoteTo(target) => current.escalate_to(target),
        }
    }
}

impl Default for RetryEscalation {
    fn default() -> Self {
        RetryEscalation::PromoteTo(MessagePriority::High)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("delivery callback for {task_id} panicked")]
pub struct CallbackPanicked {
    pub task_id: TaskId,
}

pub struct MessageTask {
    pub task_id: TaskId,
    pub priority: MessagePriority,
    /// Priority at enqueue time, before any escalation.
    pub original_priority: MessagePriority,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub payload: OutboundMessage,
    callback: Option<DeliveryCallback>,
    pub timeout: Duration,
    pub retry_count: u32,
    pub max_retries: u32,
    pub metadata: HashMap<String, serde_json::Value>,
    /// Errors raised by earlier failed attempts, resolved once the task is delivered.
    pub failed_attempts: Vec<ErrorId>,
}

impl MessageTask {
    pub fn new(
        task_id: TaskId,
        payload: OutboundMessage,
        priority: MessagePriority,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            priority,
            original_priority: priority,
            timestamp,
            sequence: 0,
            payload,
            callback: None,
            timeout: DEFAULT_TASK_TIMEOUT,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            metadata: HashMap::new(),
            failed_attempts: Vec::new(),
        }
    }

    pub fn with_callback(mut self, callback: DeliveryCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Count a failed attempt and apply the escalation policy.
    pub fn record_retry(&mut self, escalation: RetryEscalation) {
        self.retry_count += 1;
        self.priority = escalation.apply(self.priority);
    }

    /// Fire the callback (if any) with the terminal status.
    ///
    /// Consumes the task, so the callback can run at most once. A panicking
    /// callback is contained and reported as an error.
    pub fn complete(mut self, status: DeliveryStatus) -> Result<(), CallbackPanicked> {
        let Some(callback) = self.callback.take() else {
            return Ok(());
        };
        let payload = &self.payload;
        catch_unwind(AssertUnwindSafe(|| callback(payload, status))).map_err(|_| {
            CallbackPanicked {
                task_id: self.task_id,
            }
        })
    }

    fn order_key(&self) -> (MessagePriority, DateTime<Utc>, u64) {
        (self.priority, self.timestamp, self.sequence)
    }
}

impl fmt::Debug for MessageTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageTask")
            .field("task_id", &self.task_id)
            .field("priority", &self.priority)
            .field("timestamp", &self.timestamp)
            .field("sequence", &self.sequence)
            .field("to", &self.payload.to)
            .field("message_type", &self.payload.body.message_type())
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

impl PartialEq for MessageTask {
    fn eq(&self, other: &Self) -> bool {
        self.order_key() == other.order_key()
    }
}

impl Eq for MessageTask {}

impl PartialOrd for MessageTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MessageTask {
    // 小さいほど先に取り出す
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::MessageBody;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use ulid::Ulid;

    fn payload() -> OutboundMessage {
        OutboundMessage::new(
            "crane-1",
            MessageBody::MaterialTransferReject {
                source: "conveyor-1".into(),
                reason: "busy".into(),
            },
        )
    }

    fn task(priority: MessagePriority, offset_ms: i64, sequence: u64) -> MessageTask {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut t = MessageTask::new(
            TaskId::from_ulid(Ulid::new()),
            payload(),
            priority,
            base + ChronoDuration::milliseconds(offset_ms),
        );
        t.sequence = sequence;
        t
    }

    #[test]
    fn priority_dominates_timestamp() {
        let late_critical = task(MessagePriority::Critical, 1_000, 2);
        let early_low = task(MessagePriority::Low, 0, 1);
        assert!(late_critical < early_low);
    }

    #[test]
    fn equal_priority_is_fifo() {
        let first = task(MessagePriority::Normal, 0, 1);
        let second = task(MessagePriority::Normal, 5, 2);
        assert!(first < second);

        let same_instant_a = task(MessagePriority::Normal, 0, 7);
        let same_instant_b = task(MessagePriority::Normal, 0, 8);
        assert!(same_instant_a < same_instant_b);
    }

    #[test]
    fn retry_escalates_but_keeps_original() {
        let mut t = task(MessagePriority::Background, 0, 1);
        t.record_retry(RetryEscalation::default());
        assert_eq!(t.retry_count, 1);
        assert_eq!(t.priority, MessagePriority::High);
        assert_eq!(t.original_priority, MessagePriority::Background);

        let mut c = task(MessagePriority::Critical, 0, 2);
        c.record_retry(RetryEscalation::default());
        assert_eq!(c.priority, MessagePriority::Critical);

        let mut k = task(MessagePriority::Low, 0, 3);
        k.record_retry(RetryEscalation::Keep);
        assert_eq!(k.priority, MessagePriority::Low);
    }

    #[test]
    fn retry_budget() {
        let mut t = task(MessagePriority::Normal, 0, 1).with_max_retries(2);
        assert!(t.can_retry());
        t.record_retry(RetryEscalation::Keep);
        t.record_retry(RetryEscalation::Keep);
        assert!(!t.can_retry());
    }

    #[test]
    fn callback_receives_payload_and_status() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let t = task(MessagePriority::Normal, 0, 1).with_callback(Box::new(move |msg, status| {
            assert_eq!(msg.to, "crane-1");
            assert_eq!(status.to_string(), "failed");
            seen.fetch_add(1, AtomicOrdering::SeqCst);
        }));

        t.complete(DeliveryStatus::Failed).unwrap();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn panicking_callback_is_contained() {
        let t = task(MessagePriority::Normal, 0, 1)
            .with_callback(Box::new(|_, _| panic!("callback blew up")));
        assert!(t.complete(DeliveryStatus::Success).is_err());
    }

    #[test]
    fn escalation_policy_serializes() {
        let json = serde_json::to_value(RetryEscalation::default()).unwrap();
        assert_eq!(json, serde_json::json!({"promote_to": "high"}));
        let keep: RetryEscalation = serde_json::from_str("\"keep\"").unwrap();
        assert_eq!(keep, RetryEscalation::Keep);
    }
}
