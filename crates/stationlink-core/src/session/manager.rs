//! SessionManager - レジストリ + 履歴の記録
//!
//! `SessionRegistry` の操作をそのまま委譲し、状態が変わるたびに
//! `SessionRecord` をストアへ upsert する。ストアへの書き込み失敗は WARN を
//! 出すだけで、セッション操作そのものは失敗させない。

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::domain::{ProtocolSession, ProtocolState, SessionData, SessionRecord, SessionStatus};
use crate::error::SessionError;
use crate::observability::Observer;
use crate::ports::Clock;
use crate::session::registry::{SessionRegistry, TimeoutCallback};
use crate::store::RecordStore;

pub struct SessionManager {
    agent_id: String,
    registry: SessionRegistry,
    store: Option<Arc<RecordStore>>,
    clock: Arc<dyn Clock>,
    observer: Observer,
}

impl SessionManager {
    pub fn new(
        agent_id: impl Into<String>,
        registry: SessionRegistry,
        clock: Arc<dyn Clock>,
        observer: Observer,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            registry,
            store: None,
            clock,
            observer,
        }
    }

    pub fn with_store(mut self, store: Arc<RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn create(
        &self,
        session_id: &str,
        protocol_type: &str,
        source_agent: &str,
        target_agent: &str,
        timeout: Option<Duration>,
    ) -> Result<ProtocolSession, SessionError> {
        let session =
            self.registry
                .create(session_id, protocol_type, source_agent, target_agent, timeout)?;
        self.persist(&session, SessionStatus::Active);
        Ok(session)
    }

    pub fn update_state(
        &self,
        session_id: &str,
        state: ProtocolState,
        data: Option<SessionData>,
    ) -> Result<ProtocolSession, SessionError> {
        let session = self.registry.update_state(session_id, state, data)?;
        self.persist(&session, SessionStatus::from_state(session.state));
        Ok(session)
    }

    pub fn record_message_sent(&self, session_id: &str) -> Result<ProtocolSession, SessionError> {
        self.registry.record_message_sent(session_id)
    }

    pub fn record_message_received(
        &self,
        session_id: &str,
    ) -> Result<ProtocolSession, SessionError> {
        self.registry.record_message_received(session_id)
    }

    pub fn record_error(&self, session_id: &str) -> Result<ProtocolSession, SessionError> {
        let session = self.registry.record_error(session_id)?;
        self.persist(&session, SessionStatus::from_state(session.state));
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Option<ProtocolSession> {
        self.registry.get(session_id)
    }

    pub fn register_timeout_callback(
        &self,
        session_id: &str,
        callback: TimeoutCallback,
    ) -> Result<(), SessionError> {
        self.registry.register_timeout_callback(session_id, callback)
    }

    /// Drop a finished session from the registry; its timeout callback is discarded.
    pub fn remove(&self, session_id: &str) -> Option<ProtocolSession> {
        self.registry.remove(session_id)
    }

    /// Expire stale sessions. Unfinished ones are recorded with status `timeout`;
    /// finished ones keep the record written when they finished.
    pub fn sweep_expired(&self) -> Vec<ProtocolSession> {
        let expired = self.registry.sweep_expired();
        for session in expired.iter().filter(|s| !s.state.is_terminal()) {
            self.persist(session, SessionStatus::Timeout);
        }
        expired
    }

    fn persist(&self, session: &ProtocolSession, status: SessionStatus) {
        let Some(store) = &self.store else {
            return;
        };
        let record = SessionRecord::from_session(session, &self.agent_id, status, self.clock.now());
        if let Err(e) = store.save_session_record(&record) {
            self.observer.in_scope(|| {
                warn!(session_id = %session.session_id, error = %e, "failed to record session");
            });
        }
    }
}
