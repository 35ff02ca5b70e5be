//! Historical records written to the record store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ParseEnumError;
use crate::domain::errors::{ErrorAction, ErrorContext, ErrorSeverity, ErrorType};
use crate::domain::message::{InboundMessage, OutboundMessage};
use crate::domain::priority::MessagePriority;
use crate::domain::session::{ProtocolSession, ProtocolState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Failed,
    Processed,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 4] = [
        MessageStatus::Sent,
        MessageStatus::Delivered,
        MessageStatus::Failed,
        MessageStatus::Processed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
            MessageStatus::Processed => "processed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("message status", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Timeout,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 4] = [
        SessionStatus::Active,
        SessionStatus::Completed,
        SessionStatus::Failed,
        SessionStatus::Timeout,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Timeout => "timeout",
        }
    }

    pub fn from_state(state: ProtocolState) -> Self {
        match state {
            ProtocolState::Completed => SessionStatus::Completed,
            ProtocolState::Error => SessionStatus::Failed,
            ProtocolState::Idle | ProtocolState::Processing | ProtocolState::WaitingResponse => {
                SessionStatus::Active
            }
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("session status", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub receiver: String,
    pub protocol_type: String,
    pub content: serde_json::Value,
    pub priority: i64,
    pub status: MessageStatus,
    pub session_id: Option<String>,
    pub error_info: Option<serde_json::Value>,
}

impl MessageRecord {
    pub fn outbound(
        message_id: impl Into<String>,
        sender: impl Into<String>,
        message: &OutboundMessage,
        priority: MessagePriority,
        status: MessageStatus,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            timestamp,
            sender: sender.into(),
            receiver: message.to.clone(),
            protocol_type: message.body.protocol().to_string(),
            content: message.body.to_json(),
            priority: i64::from(priority.value()),
            status,
            session_id: message.body.session_id().map(str::to_string),
            error_info: None,
        }
    }

    pub fn inbound(
        message_id: impl Into<String>,
        message: &InboundMessage,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            timestamp,
            sender: message.sender.clone(),
            receiver: message.to.clone(),
            protocol_type: message.body.protocol().to_string(),
            content: message.body.to_json(),
            priority: i64::from(MessagePriority::Normal.value()),
            status: MessageStatus::Processed,
            session_id: message.body.session_id().map(str::to_string),
            error_info: None,
        }
    }

    pub fn with_error_info(mut self, error_info: serde_json::Value) -> Self {
        self.error_info = Some(error_info);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub error_id: String,
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub error_type: ErrorType,
    pub severity: ErrorSeverity,
    pub message: String,
    pub context: serde_json::Value,
    pub action_taken: ErrorAction,
    pub recovery_attempts: u32,
    pub resolved: bool,
}

impl ErrorRecord {
    pub fn from_context(ctx: &ErrorContext, action_taken: ErrorAction) -> Self {
        let context = serde_json::json!({
            "details": ctx.details,
            "session_id": ctx.session_id,
            "max_retries": ctx.max_retries,
            "next_retry_time": ctx.next_retry_time,
        });
        Self {
            error_id: ctx.error_id.to_string(),
            timestamp: ctx.timestamp,
            agent_id: ctx.agent_id.clone().unwrap_or_default(),
            error_type: ctx.error_type,
            severity: ctx.severity,
            message: ctx.message.clone(),
            context,
            action_taken,
            recovery_attempts: ctx.retry_count,
            resolved: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub protocol_type: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub messages_count: u32,
    pub error_count: u32,
}

impl SessionRecord {
    /// Snapshot a live session. `end_time` is set once the status is final.
    pub fn from_session(
        session: &ProtocolSession,
        agent_id: impl Into<String>,
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> Self {
        let end_time = match status {
            SessionStatus::Active => None,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Timeout => Some(now),
        };
        Self {
            session_id: session.session_id.clone(),
            timestamp: now,
            agent_id: agent_id.into(),
            protocol_type: session.protocol_type.clone(),
            status,
            start_time: session.created_at,
            end_time,
            messages_count: session.messages_count(),
            error_count: session.error_count,
        }
    }
}

/// Per-day aggregate kept in the `daily_stats` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub messages_sent: u32,
    pub messages_delivered: u32,
    pub errors_count: u32,
    pub sessions_completed: u32,
    /// Mean seconds between start and end of sessions completed that day.
    pub avg_response_time: f64,
}
