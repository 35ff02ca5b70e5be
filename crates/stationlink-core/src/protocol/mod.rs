//! Inbound protocol handling.

pub mod handler;
pub mod material_transfer;

pub use handler::{FnHandler, HandlerContext, HandlerRegistry, ProtocolHandler};
pub use material_transfer::{
    AcceptAll, MaterialTransferHandler, REJECT_INSUFFICIENT_CAPACITY, TransferParticipant,
};
