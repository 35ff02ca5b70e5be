//! Message payloads exchanged between stations.
//!
//! Bodies are a closed set of tagged variants. On the wire each body is a
//! JSON object carrying a `message_type` discriminator, e.g.
//! `{"message_type":"material_transfer_request","source":"conveyor-1",...}`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Routing key used to find a protocol handler (e.g. `material_transfer`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolName(String);

impl ProtocolName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Derive the protocol from a declared message type.
    ///
    /// The protocol is everything before the final `_<action>` segment:
    /// `material_transfer_request` -> `material_transfer`. A type without an
    /// underscore is its own protocol.
    pub fn from_message_type(message_type: &str) -> Self {
        let protocol = message_type
            .rsplit_once('_')
            .map(|(protocol, _action)| protocol)
            .unwrap_or(message_type);
        Self::new(protocol)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProtocolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ProtocolName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Final status reported by `material_transfer_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Success,
    Failure,
}

impl TransferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Success => "success",
            TransferStatus::Failure => "failure",
        }
    }
}

/// Protocol message bodies, one variant per `message_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum MessageBody {
    MaterialTransferRequest {
        source: String,
        material_id: String,
        quantity: u32,
        destination: String,
    },
    MaterialTransferConfirm {
        target: String,
        /// Unix seconds at which the target is ready to receive.
        ready_time: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    MaterialTransferExecute {
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    MaterialTransferComplete {
        target: String,
        status: TransferStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    MaterialTransferReject {
        source: String,
        reason: String,
    },
}

pub const MATERIAL_TRANSFER: &str = "material_transfer";

impl MessageBody {
    pub fn message_type(&self) -> &'static str {
        match self {
            MessageBody::MaterialTransferRequest { .. } => "material_transfer_request",
            MessageBody::MaterialTransferConfirm { .. } => "material_transfer_confirm",
            MessageBody::MaterialTransferExecute { .. } => "material_transfer_execute",
            MessageBody::MaterialTransferComplete { .. } => "material_transfer_complete",
            MessageBody::MaterialTransferReject { .. } => "material_transfer_reject",
        }
    }

    pub fn protocol(&self) -> ProtocolName {
        match self {
            MessageBody::MaterialTransferRequest { .. }
            | MessageBody::MaterialTransferConfirm { .. }
            | MessageBody::MaterialTransferExecute { .. }
            | MessageBody::MaterialTransferComplete { .. }
            | MessageBody::MaterialTransferReject { .. } => ProtocolName::new(MATERIAL_TRANSFER),
        }
    }

    /// Session correlation id carried by the body, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            MessageBody::MaterialTransferConfirm { session_id, .. }
            | MessageBody::MaterialTransferExecute { session_id, .. }
            | MessageBody::MaterialTransferComplete { session_id, .. } => session_id.as_deref(),
            MessageBody::MaterialTransferRequest { .. }
            | MessageBody::MaterialTransferReject { .. } => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        // A tagged enum of plain fields always serializes.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// An addressed outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub to: String,
    pub body: MessageBody,
}

impl OutboundMessage {
    pub fn new(to: impl Into<String>, body: MessageBody) -> Self {
        Self {
            to: to.into(),
            body,
        }
    }
}

/// A message received from another station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub sender: String,
    pub to: String,
    pub body: MessageBody,
}

impl InboundMessage {
    pub fn new(sender: impl Into<String>, to: impl Into<String>, body: MessageBody) -> Self {
        Self {
            sender: sender.into(),
            to: to.into(),
            body,
        }
    }

    /// Build a reply addressed back to the sender.
    pub fn reply(&self, body: MessageBody) -> OutboundMessage {
        OutboundMessage::new(self.sender.clone(), body)
    }
}
