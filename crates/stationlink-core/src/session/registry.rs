//! SessionRegistry - 進行中セッションの所有者
//!
//! # 設計
//! - セッションは `session_id` をキーにレジストリだけが所有する
//! - 呼び出し側にはクローン（スナップショット）を返す
//! - 期限切れの判定は `sweep_expired()` を呼んだときだけ行う（協調的）
//! - タイムアウトコールバックはロックを外してから呼ぶ

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::domain::{DEFAULT_SESSION_TIMEOUT, ProtocolSession, ProtocolState, SessionData};
use crate::error::SessionError;
use crate::observability::Observer;
use crate::ports::Clock;

/// Invoked once when a session is evicted by expiry.
pub type TimeoutCallback = Box<dyn FnOnce(&ProtocolSession) + Send>;

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SessionCounters {
    pub created: u64,
    pub completed: u64,
    pub expired: u64,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, ProtocolSession>>,
    timeout_callbacks: Mutex<HashMap<String, TimeoutCallback>>,
    clock: Arc<dyn Clock>,
    default_timeout: Duration,
    created: AtomicU64,
    completed: AtomicU64,
    expired: AtomicU64,
    observer: Observer,
}

impl SessionRegistry {
    pub fn new(clock: Arc<dyn Clock>, observer: Observer) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            timeout_callbacks: Mutex::new(HashMap::new()),
            clock,
            default_timeout: DEFAULT_SESSION_TIMEOUT,
            created: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            observer,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn create(
        &self,
        session_id: &str,
        protocol_type: &str,
        source_agent: &str,
        target_agent: &str,
        timeout: Option<Duration>,
    ) -> Result<ProtocolSession, SessionError> {
        let session = ProtocolSession::new(
            session_id,
            protocol_type,
            source_agent,
            target_agent,
            timeout.unwrap_or(self.default_timeout),
            self.clock.now(),
        );
        {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(session_id) {
                return Err(SessionError::AlreadyExists(session_id.to_string()));
            }
            sessions.insert(session_id.to_string(), session.clone());
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        self.observer.in_scope(|| {
            info!(session_id, protocol_type, source_agent, target_agent, "session created");
        });
        Ok(session)
    }

    /// Move a session to `state` and merge `data` into `session.data`
    /// (same keys are overwritten). Transitions out of a terminal state are rejected.
    pub fn update_state(
        &self,
        session_id: &str,
        state: ProtocolState,
        data: Option<SessionData>,
    ) -> Result<ProtocolSession, SessionError> {
        let now = self.clock.now();
        let updated = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
            if !session.state.can_transition_to(state) {
                return Err(SessionError::InvalidTransition {
                    session_id: session_id.to_string(),
                    from: session.state,
                    to: state,
                });
            }
            let newly_completed =
                state == ProtocolState::Completed && session.state != ProtocolState::Completed;
            session.state = state;
            if let Some(data) = data {
                session.data.extend(data);
            }
            session.touch(now);
            if newly_completed {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            session.clone()
        };
        self.observer.in_scope(|| {
            debug!(session_id, state = %state, "session state updated");
        });
        Ok(updated)
    }

    /// Apply `f` to a live session and refresh its activity time.
    pub fn modify(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut ProtocolSession),
    ) -> Result<ProtocolSession, SessionError> {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        f(session);
        session.touch(now);
        Ok(session.clone())
    }

    pub fn record_message_sent(&self, session_id: &str) -> Result<ProtocolSession, SessionError> {
        self.modify(session_id, |s| s.messages_sent += 1)
    }

    pub fn record_message_received(
        &self,
        session_id: &str,
    ) -> Result<ProtocolSession, SessionError> {
        self.modify(session_id, |s| s.messages_received += 1)
    }

    pub fn record_error(&self, session_id: &str) -> Result<ProtocolSession, SessionError> {
        self.modify(session_id, |s| s.error_count += 1)
    }

    pub fn get(&self, session_id: &str) -> Option<ProtocolSession> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub fn register_timeout_callback(
        &self,
        session_id: &str,
        callback: TimeoutCallback,
    ) -> Result<(), SessionError> {
        // sweep_expired と同じ順 (sessions → callbacks) で両方を握ったまま登録する
        let sessions = self.sessions.lock();
        if !sessions.contains_key(session_id) {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        self.timeout_callbacks
            .lock()
            .insert(session_id.to_string(), callback);
        drop(sessions);
        Ok(())
    }

    /// Drop a session without firing its timeout callback.
    pub fn remove(&self, session_id: &str) -> Option<ProtocolSession> {
        let removed = self.sessions.lock().remove(session_id);
        self.timeout_callbacks.lock().remove(session_id);
        removed
    }

    /// Evict every expired session, then fire their timeout callbacks.
    ///
    /// Returns the evicted sessions.
    pub fn sweep_expired(&self) -> Vec<ProtocolSession> {
        let now = self.clock.now();
        let evicted: Vec<(ProtocolSession, Option<TimeoutCallback>)> = {
            let mut sessions = self.sessions.lock();
            let mut callbacks = self.timeout_callbacks.lock();
            let expired_ids: Vec<String> = sessions
                .values()
                .filter(|s| s.is_expired(now))
                .map(|s| s.session_id.clone())
                .collect();
            expired_ids
                .into_iter()
                .filter_map(|id| {
                    let session = sessions.remove(&id)?;
                    let callback = callbacks.remove(&id);
                    Some((session, callback))
                })
                .collect()
        };

        let mut expired = Vec::with_capacity(evicted.len());
        for (session, callback) in evicted {
            self.expired.fetch_add(1, Ordering::Relaxed);
            self.observer.in_scope(|| {
                warn!(
                    session_id = %session.session_id,
                    state = %session.state,
                    timeout_secs = session.timeout.as_secs_f64(),
                    "session expired"
                );
            });
            if let Some(callback) = callback
                && catch_unwind(AssertUnwindSafe(|| callback(&session))).is_err()
            {
                self.observer.in_scope(|| {
                    error!(session_id = %session.session_id, "timeout callback panicked");
                });
            }
            expired.push(session);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Number of live sessions per state name.
    pub fn state_distribution(&self) -> BTreeMap<String, usize> {
        let mut distribution = BTreeMap::new();
        for session in self.sessions.lock().values() {
            *distribution
                .entry(session.state.as_str().to_string())
                .or_insert(0) += 1;
        }
        distribution
    }

    pub fn snapshot(&self) -> Vec<ProtocolSession> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn counters(&self) -> SessionCounters {
        SessionCounters {
            created: self.created.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}
