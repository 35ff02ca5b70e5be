//! Domain model (IDs, messages, tasks, sessions, errors, records).
//!
//! I/O を持たない純粋な型だけを置く。時刻は呼び出し側から `now` として渡す。

pub mod errors;
pub mod ids;
pub mod message;
pub mod priority;
pub mod records;
pub mod session;
pub mod task;

pub use errors::{ErrorAction, ErrorContext, ErrorSeverity, ErrorType, backoff_delay};
pub use ids::{ErrorId, MessageId, TaskId};
pub use message::{
    InboundMessage, MATERIAL_TRANSFER, MessageBody, OutboundMessage, ProtocolName, TransferStatus,
};
pub use priority::MessagePriority;
pub use records::{DailyStats, ErrorRecord, MessageRecord, MessageStatus, SessionRecord, SessionStatus};
pub use session::{DEFAULT_SESSION_TIMEOUT, ProtocolSession, ProtocolState, SessionData};
pub use task::{
    CallbackPanicked, DEFAULT_MAX_RETRIES, DEFAULT_TASK_TIMEOUT, DeliveryCallback, DeliveryStatus,
    MessageTask, RetryEscalation,
};

/// A string did not name any variant of a closed enum.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
