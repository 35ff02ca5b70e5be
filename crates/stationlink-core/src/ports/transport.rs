//! Transport ports - 配送と受信の抽象化
//!
//! コアはアドレッシング・認証・ネットワーク I/O を持たない。
//! 「宛先付きメッセージを送る」と「受信メッセージを待つ」の 2 つだけを要求する。

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{ErrorType, InboundMessage, OutboundMessage};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("destination unreachable: {0}")]
    Unreachable(String),

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("message rejected: {0}")]
    Rejected(String),

    #[error("not authorized to send to {0}")]
    Unauthorized(String),

    #[error("transport busy: {0}")]
    Busy(String),
}

impl TransportError {
    /// Classify the failure for the recovery engine.
    pub fn error_type(&self) -> ErrorType {
        match self {
            TransportError::Unreachable(_) => ErrorType::Network,
            TransportError::Timeout(_) => ErrorType::Timeout,
            TransportError::Rejected(_) => ErrorType::Protocol,
            TransportError::Unauthorized(_) => ErrorType::Authentication,
            TransportError::Busy(_) => ErrorType::Resource,
        }
    }
}

/// 宛先付きメッセージを 1 件送る
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError>;
}

/// 受信メッセージの供給元
///
/// `timeout` 以内に届かなければ `None`。呼び出し側はその間に停止要求を確認する。
#[async_trait]
pub trait InboundFeed: Send + Sync {
    async fn recv(&self, timeout: Duration) -> Option<InboundMessage>;
}
