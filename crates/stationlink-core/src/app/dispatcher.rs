//! Dispatcher - 送信キュー・受信ルーティング・セッションの窓口
//!
//! # 送信
//! `enqueue` で優先度付きキューに積み、ワーカーが 1 件ずつ `Transport` に渡す。
//! 失敗した試行は `ErrorContext` にしてリカバリエンジンに相談し、
//! 再試行なら `retry_count + 1`・優先度を昇格して積み直す。
//! 尽きたらコールバックに `failed` を渡して終わり。
//!
//! # 受信
//! `dispatch_inbound` が `message_type` からプロトコル名を求め、
//! 登録済みハンドラに渡す。返信があればそのまま送信キューへ。
//!
//! # 記録
//! ストアが付いていれば、送信・受信・エラーを都度 upsert する。
//! 書き込みに失敗しても WARN を出すだけで処理は続ける。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::app::status::DispatcherStatistics;
use crate::app::{backup_loop, run_loop, worker_loop};
use crate::config::DispatcherConfig;
use crate::domain::{
    DeliveryCallback, DeliveryStatus, ErrorAction, ErrorContext, ErrorRecord, ErrorSeverity,
    InboundMessage, MessageBody, MessagePriority, MessageRecord, MessageStatus, MessageTask,
    OutboundMessage, ProtocolName, ProtocolSession, ProtocolState, SessionData, TaskId,
};
use crate::error::{DispatchError, SessionError};
use crate::observability::Observer;
use crate::ports::{Clock, IdGenerator, InboundFeed, Transport, TransportError};
use crate::protocol::{HandlerContext, HandlerRegistry, ProtocolHandler};
use crate::queue::{PriorityMessageQueue, QueueFull};
use crate::recovery::{ErrorHandler, PriorityManager};
use crate::session::{SessionManager, TimeoutCallback};
use crate::store::RecordStore;

/// Per-task options for [`Dispatcher::enqueue_with`].
#[derive(Default)]
pub struct EnqueueOptions {
    pub priority: MessagePriority,
    pub callback: Option<DeliveryCallback>,
    /// Per-attempt send timeout; the configured default otherwise.
    pub timeout: Option<Duration>,
    pub metadata: HashMap<String, Value>,
}

impl EnqueueOptions {
    pub fn new(priority: MessagePriority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    pub fn callback(
        mut self,
        callback: impl FnOnce(&OutboundMessage, DeliveryStatus) + Send + 'static,
    ) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// What happened to one dequeued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Failed and put back with `retry_count + 1`.
    Requeued,
    /// Failed with no retries left; the callback got `failed`.
    Failed,
}

#[derive(Default)]
struct Counters {
    messages_processed: AtomicU64,
    messages_received: AtomicU64,
    errors_encountered: AtomicU64,
}

struct Background {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

struct Inner {
    agent_id: String,
    config: DispatcherConfig,
    queue: PriorityMessageQueue,
    transport: Arc<dyn Transport>,
    handlers: RwLock<HandlerRegistry>,
    sessions: Arc<SessionManager>,
    handler_ctx: HandlerContext,
    recovery: Option<Arc<ErrorHandler>>,
    priorities: PriorityManager,
    store: Option<Arc<RecordStore>>,
    auto_backup_interval: Option<Duration>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    observer: Observer,
    counters: Counters,
    background: Mutex<Option<Background>>,
}

/// Cheap to clone; clones share one queue, registry and worker.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

pub(crate) struct Parts {
    pub agent_id: String,
    pub config: DispatcherConfig,
    pub transport: Arc<dyn Transport>,
    pub handlers: HandlerRegistry,
    pub sessions: Arc<SessionManager>,
    pub recovery: Option<Arc<ErrorHandler>>,
    pub priorities: PriorityManager,
    pub store: Option<Arc<RecordStore>>,
    pub auto_backup_interval: Option<Duration>,
    pub ids: Arc<dyn IdGenerator>,
    pub clock: Arc<dyn Clock>,
    pub observer: Observer,
}

impl Dispatcher {
    pub(crate) fn from_parts(parts: Parts) -> Self {
        let handler_ctx = HandlerContext::new(
            parts.agent_id.clone(),
            Arc::clone(&parts.sessions),
            Arc::clone(&parts.clock),
            Arc::clone(&parts.ids),
            parts.observer.child("protocol"),
        );
        Self {
            inner: Arc::new(Inner {
                queue: PriorityMessageQueue::new(parts.config.queue_capacity),
                agent_id: parts.agent_id,
                config: parts.config,
                transport: parts.transport,
                handlers: RwLock::new(parts.handlers),
                sessions: parts.sessions,
                handler_ctx,
                recovery: parts.recovery,
                priorities: parts.priorities,
                store: parts.store,
                auto_backup_interval: parts.auto_backup_interval,
                ids: parts.ids,
                clock: parts.clock,
                observer: parts.observer,
                counters: Counters::default(),
                background: Mutex::new(None),
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn store(&self) -> Option<&Arc<RecordStore>> {
        self.inner.store.as_ref()
    }

    pub fn error_handler(&self) -> Option<&Arc<ErrorHandler>> {
        self.inner.recovery.as_ref()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    pub(crate) fn observer(&self) -> &Observer {
        &self.inner.observer
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Queue `payload` for send at `priority`.
    pub fn enqueue(
        &self,
        payload: OutboundMessage,
        priority: MessagePriority,
    ) -> Result<TaskId, DispatchError> {
        self.enqueue_with(payload, EnqueueOptions::new(priority))
    }

    /// Queue `payload` with a callback, timeout or metadata.
    ///
    /// Fails with `QueueFull` when the queue is at capacity; the task is dropped.
    pub fn enqueue_with(
        &self,
        payload: OutboundMessage,
        options: EnqueueOptions,
    ) -> Result<TaskId, DispatchError> {
        let inner = &self.inner;
        let task_id = inner.ids.generate_task_id();
        let mut task = MessageTask::new(task_id, payload, options.priority, inner.clock.now())
            .with_timeout(options.timeout.unwrap_or_else(|| inner.config.default_timeout()))
            .with_max_retries(inner.config.max_retries)
            .with_metadata(options.metadata);
        if let Some(callback) = options.callback {
            task = task.with_callback(callback);
        }

        let to = task.payload.to.clone();
        let message_type = task.payload.body.message_type();
        let priority = task.priority;
        if let Err(QueueFull(dropped)) = inner.queue.push(task) {
            inner.observer.in_scope(|| {
                warn!(
                    task_id = %dropped.task_id,
                    to = %to,
                    message_type,
                    capacity = inner.queue.capacity(),
                    "queue full, message dropped"
                );
            });
            return Err(DispatchError::QueueFull {
                task_id,
                capacity: inner.queue.capacity(),
            });
        }

        inner.observer.in_scope(|| {
            debug!(task_id = %task_id, to = %to, message_type, priority = %priority, "message enqueued");
        });
        Ok(task_id)
    }

    /// Queue `payload` at the priority the [`PriorityManager`] assigns it.
    pub fn send(
        &self,
        payload: OutboundMessage,
        context: Option<&Value>,
    ) -> Result<TaskId, DispatchError> {
        let priority = self
            .inner
            .priorities
            .calculate_priority(&payload.body.to_json(), context);
        self.enqueue(payload, priority)
    }

    /// Wait up to the poll interval for a task and attempt it once.
    pub async fn process_next(&self) -> Option<DeliveryOutcome> {
        let task = self.next_task().await?;
        Some(self.deliver(task).await)
    }

    /// Cancel-safe: a task is only taken off the queue on the final, non-awaiting step.
    pub(crate) async fn next_task(&self) -> Option<MessageTask> {
        self.inner.queue.pop(self.inner.config.poll_interval()).await
    }

    pub(crate) async fn deliver(&self, task: MessageTask) -> DeliveryOutcome {
        let inner = &self.inner;
        let result =
            match tokio::time::timeout(task.timeout, inner.transport.send(&task.payload)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(task.timeout)),
            };

        match result {
            Ok(()) => {
                inner.counters.messages_processed.fetch_add(1, Ordering::Relaxed);
                inner.observer.in_scope(|| {
                    debug!(
                        task_id = %task.task_id,
                        to = %task.payload.to,
                        retry_count = task.retry_count,
                        "message delivered"
                    );
                });
                self.record_outbound(&task, MessageStatus::Delivered, None);
                self.resolve_attempts(&task);
                self.finish(task, DeliveryStatus::Success);
                DeliveryOutcome::Delivered
            }
            Err(err) => self.on_failure(task, err),
        }
    }

    fn on_failure(&self, mut task: MessageTask, err: TransportError) -> DeliveryOutcome {
        let inner = &self.inner;
        let error_id = inner.ids.generate_error_id();
        let mut ctx = ErrorContext::new(
            error_id,
            inner.clock.now(),
            ErrorSeverity::Medium,
            err.error_type(),
            err.to_string(),
        )
        .with_agent(inner.agent_id.clone())
        .with_retry_budget(task.retry_count, task.max_retries)
        .with_detail("task_id", json!(task.task_id.to_string()))
        .with_detail("to", json!(task.payload.to))
        .with_detail("message_type", json!(task.payload.body.message_type()));
        if let Some(session_id) = task.payload.body.session_id() {
            ctx = ctx.with_session(session_id);
            // the session may already be gone
            let _ = inner.sessions.record_error(session_id);
        }

        let action = inner.recovery.as_ref().map(|handler| handler.handle_error(&mut ctx));
        let retry = task.can_retry()
            && action.is_none_or(|a| matches!(a, ErrorAction::Retry | ErrorAction::Fallback));
        let action_taken = action.unwrap_or(if retry {
            ErrorAction::Retry
        } else {
            ErrorAction::Escalate
        });
        self.record_error(&ctx, action_taken);

        let error_info = json!({
            "error_id": error_id.to_string(),
            "error": err.to_string(),
            "error_type": err.error_type().as_str(),
            "retry_count": task.retry_count,
        });

        if retry {
            task.failed_attempts.push(error_id);
            task.record_retry(inner.config.retry_escalation);
            inner.observer.in_scope(|| {
                warn!(
                    task_id = %task.task_id,
                    to = %task.payload.to,
                    error = %err,
                    retry_count = task.retry_count,
                    max_retries = task.max_retries,
                    priority = %task.priority,
                    "delivery failed, retrying"
                );
            });
            self.record_outbound(&task, MessageStatus::Sent, Some(error_info));
            inner.queue.push_retry(task);
            DeliveryOutcome::Requeued
        } else {
            inner.counters.errors_encountered.fetch_add(1, Ordering::Relaxed);
            inner.observer.in_scope(|| {
                error!(
                    task_id = %task.task_id,
                    to = %task.payload.to,
                    error = %err,
                    retry_count = task.retry_count,
                    "delivery failed, giving up"
                );
            });
            if let Some(handler) = &inner.recovery {
                for id in task.failed_attempts.iter().chain(std::iter::once(&error_id)) {
                    handler.discard(*id);
                }
            }
            self.record_outbound(&task, MessageStatus::Failed, Some(error_info));
            self.finish(task, DeliveryStatus::Failed);
            DeliveryOutcome::Failed
        }
    }

    fn finish(&self, task: MessageTask, status: DeliveryStatus) {
        if let Err(e) = task.complete(status) {
            self.inner.observer.in_scope(|| {
                error!(task_id = %e.task_id, status = %status, "delivery callback panicked");
            });
        }
    }

    /// Earlier failures of a now-delivered task count as recovered.
    fn resolve_attempts(&self, task: &MessageTask) {
        let inner = &self.inner;
        for error_id in &task.failed_attempts {
            if let Some(handler) = &inner.recovery {
                // escalated or skipped errors are no longer active
                let _ = handler.resolve(*error_id);
            }
            if let Some(store) = &inner.store
                && let Err(e) = store.mark_error_resolved(&error_id.to_string())
            {
                inner.observer.in_scope(|| {
                    warn!(error_id = %error_id, error = %e, "failed to mark error resolved");
                });
            }
        }
    }

    fn record_outbound(&self, task: &MessageTask, status: MessageStatus, error_info: Option<Value>) {
        let inner = &self.inner;
        let Some(store) = &inner.store else {
            return;
        };
        let mut record = MessageRecord::outbound(
            task.task_id.to_string(),
            inner.agent_id.clone(),
            &task.payload,
            task.priority,
            status,
            inner.clock.now(),
        );
        if let Some(info) = error_info {
            record = record.with_error_info(info);
        }
        if let Err(e) = store.save_message_record(&record) {
            inner.observer.in_scope(|| {
                warn!(task_id = %task.task_id, error = %e, "failed to record message");
            });
        }
    }

    fn record_error(&self, ctx: &ErrorContext, action: ErrorAction) {
        let inner = &self.inner;
        let Some(store) = &inner.store else {
            return;
        };
        if let Err(e) = store.save_error_record(&ErrorRecord::from_context(ctx, action)) {
            inner.observer.in_scope(|| {
                warn!(error_id = %ctx.error_id, error = %e, "failed to record error");
            });
        }
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Register the handler for `protocol`. A second handler for the same
    /// protocol is rejected.
    pub fn register_handler(
        &self,
        protocol: impl Into<ProtocolName>,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Result<(), DispatchError> {
        let protocol = protocol.into();
        self.inner.handlers.write().register(protocol.clone(), handler)?;
        self.inner
            .observer
            .in_scope(|| info!(protocol = %protocol, "handler registered"));
        Ok(())
    }

    pub fn protocols(&self) -> Vec<ProtocolName> {
        self.inner.handlers.read().protocols()
    }

    /// Route one inbound message to its protocol handler and queue the reply.
    ///
    /// Returns the reply's task id, if the handler produced one.
    pub async fn dispatch_inbound(
        &self,
        message: InboundMessage,
    ) -> Result<Option<TaskId>, DispatchError> {
        let inner = &self.inner;
        let protocol = ProtocolName::from_message_type(message.body.message_type());
        let handler = inner
            .handlers
            .read()
            .get(&protocol)
            .cloned()
            .ok_or_else(|| DispatchError::HandlerNotFound(protocol.clone()))?;

        inner.counters.messages_received.fetch_add(1, Ordering::Relaxed);
        self.record_inbound(&message);
        inner.observer.in_scope(|| {
            debug!(
                from = %message.sender,
                message_type = message.body.message_type(),
                protocol = %protocol,
                "inbound message"
            );
        });

        let reply = handler
            .handle(&inner.handler_ctx, &message)
            .await
            .map_err(|source| DispatchError::Handler {
                protocol: protocol.clone(),
                source,
            })?;

        match reply {
            Some(reply) => Ok(Some(self.send(reply, None)?)),
            None => Ok(None),
        }
    }

    /// Decode a raw JSON body and dispatch it. Undecodable bodies are logged
    /// and reported as `Decode`.
    pub async fn dispatch_inbound_json(
        &self,
        sender: &str,
        body: Value,
    ) -> Result<Option<TaskId>, DispatchError> {
        let body: MessageBody = match serde_json::from_value(body) {
            Ok(body) => body,
            Err(e) => {
                self.inner.observer.in_scope(|| {
                    warn!(from = sender, error = %e, "undecodable inbound message dropped");
                });
                return Err(DispatchError::Decode(e));
            }
        };
        let message = InboundMessage::new(sender, self.inner.agent_id.clone(), body);
        self.dispatch_inbound(message).await
    }

    fn record_inbound(&self, message: &InboundMessage) {
        let inner = &self.inner;
        let Some(store) = &inner.store else {
            return;
        };
        let record = MessageRecord::inbound(
            inner.ids.generate_message_id().to_string(),
            message,
            inner.clock.now(),
        );
        if let Err(e) = store.save_message_record(&record) {
            inner.observer.in_scope(|| {
                warn!(from = %message.sender, error = %e, "failed to record inbound message");
            });
        }
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    pub fn create_session(
        &self,
        session_id: &str,
        protocol_type: &str,
        source_agent: &str,
        target_agent: &str,
        timeout: Option<Duration>,
    ) -> Result<ProtocolSession, SessionError> {
        self.inner
            .sessions
            .create(session_id, protocol_type, source_agent, target_agent, timeout)
    }

    /// Move a session to `state`, merging `data` into its free-form data.
    pub fn update_session_state(
        &self,
        session_id: &str,
        state: ProtocolState,
        data: Option<SessionData>,
    ) -> Result<ProtocolSession, SessionError> {
        self.inner.sessions.update_state(session_id, state, data)
    }

    pub fn get_session(&self, session_id: &str) -> Option<ProtocolSession> {
        self.inner.sessions.get(session_id)
    }

    pub fn register_session_timeout_callback(
        &self,
        session_id: &str,
        callback: impl FnOnce(&ProtocolSession) + Send + 'static,
    ) -> Result<(), SessionError> {
        let callback: TimeoutCallback = Box::new(callback);
        self.inner
            .sessions
            .register_timeout_callback(session_id, callback)
    }

    /// Expire stale sessions now. Returns how many were evicted.
    pub fn sweep_sessions(&self) -> usize {
        let expired = self.inner.sessions.sweep_expired();
        if !expired.is_empty() {
            self.inner.observer.in_scope(|| {
                info!(expired = expired.len(), "expired sessions swept");
            });
        }
        expired.len()
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn statistics(&self) -> DispatcherStatistics {
        let inner = &self.inner;
        let registry = inner.sessions.registry();
        let sessions = registry.counters();
        DispatcherStatistics {
            agent_id: inner.agent_id.clone(),
            messages_processed: inner.counters.messages_processed.load(Ordering::Relaxed),
            messages_received: inner.counters.messages_received.load(Ordering::Relaxed),
            errors_encountered: inner.counters.errors_encountered.load(Ordering::Relaxed),
            sessions_created: sessions.created,
            sessions_completed: sessions.completed,
            sessions_expired: sessions.expired,
            active_sessions: registry.len(),
            queue_size: inner.queue.len(),
            session_states: registry.state_distribution(),
            recovery: inner.recovery.as_ref().map(|handler| handler.statistics()),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn is_running(&self) -> bool {
        self.inner.background.lock().is_some()
    }

    /// Spawn the dispatch worker, the inbound/sweep loop and (with a store and
    /// a backup interval) the auto-backup loop.
    pub fn start(&self, feed: Option<Arc<dyn InboundFeed>>) -> Result<(), DispatchError> {
        let mut background = self.inner.background.lock();
        if background.is_some() {
            return Err(DispatchError::AlreadyRunning);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = self.inner.observer.span().clone();
        let mut joins = Vec::with_capacity(3);

        joins.push(tokio::spawn(
            worker_loop::run(self.clone(), shutdown_rx.clone()).instrument(span.clone()),
        ));
        joins.push(tokio::spawn(
            run_loop::run(self.clone(), feed, shutdown_rx.clone()).instrument(span.clone()),
        ));
        if let (Some(store), Some(interval)) = (&self.inner.store, self.inner.auto_backup_interval) {
            joins.push(tokio::spawn(
                backup_loop::run(
                    Arc::clone(store),
                    interval,
                    shutdown_rx,
                    self.inner.observer.child("backup"),
                )
                .instrument(span),
            ));
        }

        *background = Some(Background { shutdown_tx, joins });
        self.inner.observer.in_scope(|| info!("dispatcher started"));
        Ok(())
    }

    /// Start, run until `shutdown` resolves, then stop.
    pub async fn run(
        &self,
        feed: Option<Arc<dyn InboundFeed>>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), DispatchError> {
        self.start(feed)?;
        shutdown.await;
        self.stop().await;
        Ok(())
    }

    /// Signal shutdown and wait (bounded by the shutdown grace) for the
    /// background tasks. Tasks still queued are abandoned.
    pub async fn stop(&self) {
        let Some(background) = self.inner.background.lock().take() else {
            return;
        };
        // receivers may already be gone
        let _ = background.shutdown_tx.send(true);

        let grace = self.inner.config.shutdown_grace();
        for join in background.joins {
            let abort = join.abort_handle();
            if tokio::time::timeout(grace, join).await.is_err() {
                self.inner
                    .observer
                    .in_scope(|| warn!(grace_secs = grace.as_secs(), "background task did not stop in time, aborting"));
                abort.abort();
            }
        }

        let abandoned = self.inner.queue.clear();
        self.inner
            .observer
            .in_scope(|| info!(abandoned, "dispatcher stopped"));
    }
}
