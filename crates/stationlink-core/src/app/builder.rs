//! DispatcherBuilder - ディスパッチャの構築とワイヤリング
//!
//! # Fail-fast
//! - `expect_protocols()` で必要なプロトコルを宣言
//! - `build()` 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - 不足があれば `BuildError::MissingProtocols` を返す
//!
//! 起動後に「このプロトコルのハンドラがない」と気づくより、起動時に落ちる方がよい。

use std::sync::Arc;

use crate::app::dispatcher::{Dispatcher, Parts};
use crate::config::Config;
use crate::domain::ProtocolName;
use crate::error::DispatchError;
use crate::observability::Observer;
use crate::ports::{Clock, IdGenerator, SystemClock, Transport, UlidGenerator};
use crate::protocol::{HandlerRegistry, ProtocolHandler};
use crate::recovery::{ErrorHandler, PriorityManager};
use crate::session::{SessionManager, SessionRegistry};
use crate::store::RecordStore;

/// Error returned by [`DispatcherBuilder::build`].
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing protocols: {0:?}. These protocols were expected but have no handler.")]
    MissingProtocols(Vec<String>),
}

enum Recovery {
    None,
    Defaults,
    Custom(ErrorHandler),
}

/// # 使用例
/// ```ignore
/// let dispatcher = DispatcherBuilder::new("crane-1", transport)
///     .config(&config)
///     .store(store)
///     .default_recovery()
///     .handler(MATERIAL_TRANSFER, Arc::new(MaterialTransferHandler::new(participant)))?
///     .expect_protocols(&[MATERIAL_TRANSFER])
///     .build()?;
/// ```
pub struct DispatcherBuilder {
    agent_id: String,
    transport: Arc<dyn Transport>,
    config: Config,
    handlers: HandlerRegistry,
    expected_protocols: Option<Vec<String>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    store: Option<Arc<RecordStore>>,
    recovery: Recovery,
    priorities: Option<PriorityManager>,
    observer: Option<Observer>,
}

impl DispatcherBuilder {
    pub fn new(agent_id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            agent_id: agent_id.into(),
            transport,
            config: Config::default(),
            handlers: HandlerRegistry::default(),
            expected_protocols: None,
            clock: None,
            ids: None,
            store: None,
            recovery: Recovery::None,
            priorities: None,
            observer: None,
        }
    }

    /// Dispatcher, session and recovery settings. The store section is only
    /// read for the auto-backup interval; open the store separately.
    pub fn config(mut self, config: &Config) -> Self {
        self.config = config.clone();
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Persist messages, errors and sessions to `store`.
    pub fn store(mut self, store: Arc<RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn recovery(mut self, handler: ErrorHandler) -> Self {
        self.recovery = Recovery::Custom(handler);
        self
    }

    /// Recovery with the built-in strategies and rules, tuned from the
    /// `recovery` section of the config.
    pub fn default_recovery(mut self) -> Self {
        self.recovery = Recovery::Defaults;
        self
    }

    pub fn priority_manager(mut self, priorities: PriorityManager) -> Self {
        self.priorities = Some(priorities);
        self
    }

    pub fn observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Handler を登録
    pub fn handler(
        mut self,
        protocol: impl Into<ProtocolName>,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Result<Self, DispatchError> {
        self.handlers.register(protocol.into(), handler)?;
        Ok(self)
    }

    /// 期待されるプロトコルのリストを設定
    pub fn expect_protocols(mut self, protocols: &[&str]) -> Self {
        self.expected_protocols = Some(protocols.iter().map(|p| p.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Dispatcher, BuildError> {
        if let Some(expected) = &self.expected_protocols {
            let missing: Vec<String> = expected
                .iter()
                .filter(|p| !self.handlers.contains(&ProtocolName::new(p.as_str())))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingProtocols(missing));
            }
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let observer = self
            .observer
            .unwrap_or_else(|| Observer::new(&self.agent_id, "dispatcher"));

        let registry = SessionRegistry::new(Arc::clone(&clock), observer.child("sessions"))
            .with_default_timeout(self.config.sessions.default_timeout());
        let mut sessions = SessionManager::new(
            self.agent_id.clone(),
            registry,
            Arc::clone(&clock),
            observer.child("sessions"),
        );
        if let Some(store) = &self.store {
            sessions = sessions.with_store(Arc::clone(store));
        }

        let recovery = match self.recovery {
            Recovery::None => None,
            Recovery::Defaults => Some(ErrorHandler::with_defaults(
                &self.config.recovery,
                Arc::clone(&clock),
                observer.child("recovery"),
            )),
            Recovery::Custom(handler) => Some(handler),
        };

        Ok(Dispatcher::from_parts(Parts {
            agent_id: self.agent_id,
            auto_backup_interval: self.config.store.auto_backup_interval(),
            config: self.config.dispatcher,
            transport: self.transport,
            handlers: self.handlers,
            sessions: Arc::new(sessions),
            recovery: recovery.map(Arc::new),
            priorities: self
                .priorities
                .unwrap_or_else(PriorityManager::with_default_rules),
            store: self.store,
            ids,
            clock,
            observer,
        }))
    }
}
