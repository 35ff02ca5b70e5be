//! Status - ディスパッチャの統計スナップショット

use std::collections::BTreeMap;

use serde::Serialize;

use crate::recovery::ErrorHandlerStatistics;

/// Point-in-time view of a dispatcher, cheap to build and serialize.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatcherStatistics {
    pub agent_id: String,
    /// Outbound tasks delivered.
    pub messages_processed: u64,
    /// Inbound messages handed to a handler.
    pub messages_received: u64,
    /// Outbound tasks that ran out of retries.
    pub errors_encountered: u64,
    pub sessions_created: u64,
    pub sessions_completed: u64,
    pub sessions_expired: u64,
    pub active_sessions: usize,
    pub queue_size: usize,
    /// Live sessions per state name.
    pub session_states: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery: Option<ErrorHandlerStatistics>,
}
