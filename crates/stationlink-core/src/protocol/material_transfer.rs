//! material_transfer プロトコル
//!
//! 2 ステーション間の搬送のやりとり:
//!
//! ```text
//! requester                      receiver
//!   request  ─────────────────▶  session 作成 (WaitingResponse)
//!            ◀─────────────────  confirm {session_id, ready_time}
//!   execute  ─────────────────▶  Processing
//!            ◀─────────────────  complete {status}   → Completed
//! ```
//!
//! 受け入れ可否と準備時間は `TransferParticipant` が決める。断る場合は
//! `reject {reason}` を返し、セッションは作らない。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::domain::{
    InboundMessage, MATERIAL_TRANSFER, MessageBody, OutboundMessage, ProtocolState, SessionData,
    TransferStatus,
};
use crate::error::HandlerError;
use crate::protocol::handler::{HandlerContext, ProtocolHandler};

pub const REJECT_INSUFFICIENT_CAPACITY: &str = "insufficient_capacity";

/// Station-side decisions for incoming transfers.
pub trait TransferParticipant: Send + Sync {
    /// Whether this station can take `quantity` of `material_id` now.
    fn accepts(&self, _material_id: &str, _quantity: u32) -> bool {
        true
    }

    /// Time until the station is ready to receive.
    fn ready_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(5)
    }

    /// Called once the receiving side has completed a transfer.
    fn on_completed(&self, _session_id: &str) {}
}

/// Accepts everything, ready in 5s.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl TransferParticipant for AcceptAll {}

pub struct MaterialTransferHandler {
    participant: Arc<dyn TransferParticipant>,
    session_timeout: Option<Duration>,
}

impl MaterialTransferHandler {
    pub fn new(participant: Arc<dyn TransferParticipant>) -> Self {
        Self {
            participant,
            session_timeout: None,
        }
    }

    /// Timeout for sessions opened by incoming requests; the registry default otherwise.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    fn on_request(
        &self,
        ctx: &HandlerContext,
        message: &InboundMessage,
        source: &str,
        material_id: &str,
        quantity: u32,
        destination: &str,
    ) -> Result<Option<OutboundMessage>, HandlerError> {
        let agent = ctx.agent_id();
        if !self.participant.accepts(material_id, quantity) {
            ctx.observer().in_scope(|| {
                warn!(from = %message.sender, material_id, quantity, "transfer request rejected");
            });
            return Ok(Some(message.reply(MessageBody::MaterialTransferReject {
                source: agent.to_string(),
                reason: REJECT_INSUFFICIENT_CAPACITY.to_string(),
            })));
        }

        let now = ctx.now();
        // 同じ送信元から同時刻に届いても衝突しないよう ULID を付ける
        let session_id = format!(
            "transfer_{}_{}_{}",
            message.sender,
            agent,
            ctx.ids().generate_ulid()
        );
        let transfer = SessionData::from([
            ("material_id".to_string(), json!(material_id)),
            ("quantity".to_string(), json!(quantity)),
            ("destination".to_string(), json!(destination)),
        ]);
        let sessions = ctx.sessions();
        sessions.create(&session_id, MATERIAL_TRANSFER, source, agent, self.session_timeout)?;
        sessions.record_message_received(&session_id)?;
        sessions.update_state(&session_id, ProtocolState::WaitingResponse, Some(transfer))?;
        sessions.record_message_sent(&session_id)?;

        ctx.observer().in_scope(|| {
            info!(session_id = %session_id, from = %message.sender, material_id, quantity, "transfer confirmed");
        });
        Ok(Some(message.reply(MessageBody::MaterialTransferConfirm {
            target: agent.to_string(),
            ready_time: (now + self.participant.ready_delay()).timestamp(),
            session_id: Some(session_id),
        })))
    }

    fn on_execute(
        &self,
        ctx: &HandlerContext,
        message: &InboundMessage,
        session_id: Option<&str>,
    ) -> Result<Option<OutboundMessage>, HandlerError> {
        let session_id = session_id.ok_or(HandlerError::MissingField {
            message_type: message.body.message_type(),
            field: "session_id",
        })?;

        let sessions = ctx.sessions();
        sessions.update_state(session_id, ProtocolState::Processing, None)?;
        sessions.record_message_received(session_id)?;
        sessions.record_message_sent(session_id)?;
        sessions.update_state(session_id, ProtocolState::Completed, None)?;
        self.participant.on_completed(session_id);

        ctx.observer().in_scope(|| {
            info!(session_id, from = %message.sender, "transfer executed");
        });
        Ok(Some(message.reply(MessageBody::MaterialTransferComplete {
            target: ctx.agent_id().to_string(),
            status: TransferStatus::Success,
            session_id: Some(session_id.to_string()),
        })))
    }
}

#[async_trait]
impl ProtocolHandler for MaterialTransferHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        message: &InboundMessage,
    ) -> Result<Option<OutboundMessage>, HandlerError> {
        match &message.body {
            MessageBody::MaterialTransferRequest {
                source,
                material_id,
                quantity,
                destination,
            } => self.on_request(ctx, message, source, material_id, *quantity, destination),

            // requester side: the receiver is ready, go ahead
            MessageBody::MaterialTransferConfirm {
                target,
                ready_time,
                session_id,
            } => {
                ctx.observer().in_scope(|| {
                    info!(receiver = %target, ready_time, session_id = ?session_id, "transfer confirmed by receiver");
                });
                Ok(Some(message.reply(MessageBody::MaterialTransferExecute {
                    source: ctx.agent_id().to_string(),
                    session_id: session_id.clone(),
                })))
            }

            MessageBody::MaterialTransferExecute { session_id, .. } => {
                self.on_execute(ctx, message, session_id.as_deref())
            }

            MessageBody::MaterialTransferComplete {
                target,
                status,
                session_id,
            } => {
                ctx.observer().in_scope(|| {
                    info!(receiver = %target, status = status.as_str(), session_id = ?session_id, "transfer complete");
                });
                Ok(None)
            }

            MessageBody::MaterialTransferReject { source, reason } => {
                ctx.observer().in_scope(|| {
                    warn!(source = %source, reason = %reason, "transfer rejected by receiver");
                });
                Ok(None)
            }
        }
    }
}
