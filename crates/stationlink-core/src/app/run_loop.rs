//! RunLoop - 受信の取り込みと期限切れセッションの掃除
//!
//! 受信フィードは `poll_interval` ごとに区切って待ち、その合間に
//! 停止要求と掃除のタイミングを確認する。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::warn;

use crate::app::dispatcher::Dispatcher;
use crate::ports::InboundFeed;

pub(crate) async fn run(
    dispatcher: Dispatcher,
    feed: Option<Arc<dyn InboundFeed>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let poll = dispatcher.config().poll_interval();
    let sweep_every = dispatcher.config().sweep_interval();
    let mut sweep = tokio::time::interval_at(Instant::now() + sweep_every, sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = sweep.tick() => {
                dispatcher.sweep_sessions();
            }
            message = recv(feed.as_deref(), poll) => {
                let Some(message) = message else {
                    continue;
                };
                let sender = message.sender.clone();
                if let Err(e) = dispatcher.dispatch_inbound(message).await {
                    dispatcher
                        .observer()
                        .in_scope(|| warn!(from = %sender, error = %e, "inbound message not handled"));
                }
            }
        }
    }
}

async fn recv(
    feed: Option<&dyn InboundFeed>,
    timeout: std::time::Duration,
) -> Option<crate::domain::InboundMessage> {
    match feed {
        Some(feed) => feed.recv(timeout).await,
        None => {
            tokio::time::sleep(timeout).await;
            None
        }
    }
}
