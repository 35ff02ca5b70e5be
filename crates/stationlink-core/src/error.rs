use thiserror::Error;

use crate::domain::{ErrorId, ProtocolName, ProtocolState, TaskId};

pub use crate::ports::transport::TransportError;
pub use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("queue full (capacity={capacity}), dropped task {task_id}")]
    QueueFull { task_id: TaskId, capacity: usize },

    #[error("handler not found for protocol={0}")]
    HandlerNotFound(ProtocolName),

    #[error("duplicate handler for protocol={0}")]
    DuplicateHandler(ProtocolName),

    #[error("handler for protocol={protocol} failed: {source}")]
    Handler {
        protocol: ProtocolName,
        #[source]
        source: HandlerError,
    },

    #[error("undecodable inbound message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("dispatcher is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("session {session_id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        session_id: String,
        from: ProtocolState,
        to: ProtocolState,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("retry budget exhausted for {error_id} ({retry_count}/{max_retries})")]
    RetryBudgetExhausted {
        error_id: ErrorId,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("no active error with id {0}")]
    UnknownError(ErrorId),
}

/// Failure inside a protocol handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("message {message_type} is missing {field}")]
    MissingField {
        message_type: &'static str,
        field: &'static str,
    },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
