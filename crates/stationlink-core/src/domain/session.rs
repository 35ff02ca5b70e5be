//! ProtocolSession - 複数メッセージにまたがるやり取りの状態
//!
//! # 状態遷移
//! ```text
//! Idle <-> Processing <-> WaitingResponse
//!   \          |              /
//!    +----> Completed / Error
//! ```
//! - 初期状態は `Idle`
//! - 生存中の 3 状態の間は自由に遷移できる
//! - `Completed` / `Error` は終端。そこからの遷移は拒否する
//! - 期限切れは状態ではなく、レジストリからの除去

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ParseEnumError;

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolState {
    Idle,
    Processing,
    WaitingResponse,
    Completed,
    Error,
}

impl ProtocolState {
    pub const ALL: [ProtocolState; 5] = [
        ProtocolState::Idle,
        ProtocolState::Processing,
        ProtocolState::WaitingResponse,
        ProtocolState::Completed,
        ProtocolState::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolState::Idle => "idle",
            ProtocolState::Processing => "processing",
            ProtocolState::WaitingResponse => "waiting_response",
            ProtocolState::Completed => "completed",
            ProtocolState::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ProtocolState::Completed | ProtocolState::Error)
    }

    pub fn can_transition_to(self, next: ProtocolState) -> bool {
        !self.is_terminal() || self == next
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("protocol state", s))
    }
}

/// Free-form per-session values a protocol keeps between messages.
pub type SessionData = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSession {
    pub session_id: String,
    pub protocol_type: String,
    pub source_agent: String,
    pub target_agent: String,
    pub state: ProtocolState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub timeout: Duration,
    pub messages_sent: u32,
    pub messages_received: u32,
    pub error_count: u32,
    pub data: SessionData,
}

impl ProtocolSession {
    pub fn new(
        session_id: impl Into<String>,
        protocol_type: impl Into<String>,
        source_agent: impl Into<String>,
        target_agent: impl Into<String>,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            protocol_type: protocol_type.into(),
            source_agent: source_agent.into(),
            target_agent: target_agent.into(),
            state: ProtocolState::Idle,
            created_at: now,
            last_activity: now,
            timeout,
            messages_sent: 0,
            messages_received: 0,
            error_count: 0,
            data: HashMap::new(),
        }
    }

    /// Refresh `last_activity`. Never moves it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    /// Expired iff `now - last_activity > timeout`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match now.signed_duration_since(self.last_activity).to_std() {
            Ok(idle) => idle > self.timeout,
            // now が last_activity より前: 期限切れではない
            Err(_) => false,
        }
    }

    pub fn messages_count(&self) -> u32 {
        self.messages_sent + self.messages_received
    }
}
