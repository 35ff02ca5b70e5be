//! Protocol handlers and their registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{InboundMessage, OutboundMessage, ProtocolName};
use crate::error::{DispatchError, HandlerError};
use crate::observability::Observer;
use crate::ports::{Clock, IdGenerator};
use crate::session::SessionManager;

/// What a handler can see of the station it runs in.
#[derive(Clone)]
pub struct HandlerContext {
    agent_id: String,
    sessions: Arc<SessionManager>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    observer: Observer,
}

impl HandlerContext {
    pub fn new(
        agent_id: impl Into<String>,
        sessions: Arc<SessionManager>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        observer: Observer,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            sessions,
            clock,
            ids,
            observer,
        }
    }

    /// This station's id.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn ids(&self) -> &dyn IdGenerator {
        self.ids.as_ref()
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }
}

/// Handles every inbound message of one protocol.
///
/// Returning `Some(reply)` asks the dispatcher to enqueue the reply for send.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        message: &InboundMessage,
    ) -> Result<Option<OutboundMessage>, HandlerError>;
}

/// Adapter for plain synchronous closures.
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: Fn(&HandlerContext, &InboundMessage) -> Result<Option<OutboundMessage>, HandlerError>
        + Send
        + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> ProtocolHandler for FnHandler<F>
where
    F: Fn(&HandlerContext, &InboundMessage) -> Result<Option<OutboundMessage>, HandlerError>
        + Send
        + Sync,
{
    async fn handle(
        &self,
        ctx: &HandlerContext,
        message: &InboundMessage,
    ) -> Result<Option<OutboundMessage>, HandlerError> {
        (self.0)(ctx, message)
    }
}

/// Registry of handlers (protocol -> handler).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ProtocolName, Arc<dyn ProtocolHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a protocol. A second handler for the same
    /// protocol is rejected.
    pub fn register(
        &mut self,
        protocol: ProtocolName,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Result<(), DispatchError> {
        if self.handlers.contains_key(&protocol) {
            return Err(DispatchError::DuplicateHandler(protocol));
        }
        self.handlers.insert(protocol, handler);
        Ok(())
    }

    pub fn get(&self, protocol: &ProtocolName) -> Option<&Arc<dyn ProtocolHandler>> {
        self.handlers.get(protocol)
    }

    pub fn contains(&self, protocol: &ProtocolName) -> bool {
        self.handlers.contains_key(protocol)
    }

    /// Registered protocols, sorted.
    pub fn protocols(&self) -> Vec<ProtocolName> {
        let mut protocols: Vec<_> = self.handlers.keys().cloned().collect();
        protocols.sort();
        protocols
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
