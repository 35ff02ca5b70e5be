//! In-memory transport（開発・テスト用）
//!
//! `LoopbackNetwork` が同一プロセス内のステーションをつなぐ。
//! 各ステーションは `register()` で受信箱 (`InMemoryFeed`) を得て、
//! `transport()` で送信側 (`InMemoryTransport`) を得る。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::domain::{InboundMessage, OutboundMessage};
use crate::ports::{InboundFeed, Transport, TransportError};

type Mailboxes = HashMap<String, mpsc::UnboundedSender<InboundMessage>>;

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    mailboxes: Arc<Mutex<Mailboxes>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a station and return its inbound feed.
    ///
    /// Registering the same name again replaces the previous mailbox.
    pub fn register(&self, agent: impl Into<String>) -> InMemoryFeed {
        let (tx, feed) = InMemoryFeed::channel();
        self.mailboxes.lock().insert(agent.into(), tx);
        feed
    }

    pub fn transport(&self, sender: impl Into<String>) -> InMemoryTransport {
        InMemoryTransport {
            sender: sender.into(),
            mailboxes: Arc::clone(&self.mailboxes),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// Sends into the mailboxes of a `LoopbackNetwork`.
#[derive(Clone)]
pub struct InMemoryTransport {
    sender: String,
    mailboxes: Arc<Mutex<Mailboxes>>,
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
}

impl InMemoryTransport {
    /// Messages delivered so far, in delivery order.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let inbound = InboundMessage::new(self.sender.clone(), message.to.clone(), message.body.clone());
        {
            let mailboxes = self.mailboxes.lock();
            let mailbox = mailboxes
                .get(&message.to)
                .ok_or_else(|| TransportError::Unreachable(message.to.clone()))?;
            mailbox
                .send(inbound)
                .map_err(|_| TransportError::Unreachable(message.to.clone()))?;
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }
}

/// Inbound mailbox backed by an unbounded channel.
pub struct InMemoryFeed {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
}

impl InMemoryFeed {
    pub fn channel() -> (mpsc::UnboundedSender<InboundMessage>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                rx: tokio::sync::Mutex::new(rx),
            },
        )
    }
}

#[async_trait]
impl InboundFeed for InMemoryFeed {
    async fn recv(&self, timeout: Duration) -> Option<InboundMessage> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }
}

/// Accepts everything and remembers the order.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        self.sent.lock().push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageBody;

    fn reject(to: &str) -> OutboundMessage {
        OutboundMessage::new(
            to,
            MessageBody::MaterialTransferReject {
                source: "a".into(),
                reason: "full".into(),
            },
        )
    }

    #[tokio::test]
    async fn loopback_delivers_to_registered_station() {
        let net = LoopbackNetwork::new();
        let feed_b = net.register("b");
        let transport_a = net.transport("a");

        transport_a.send(&reject("b")).await.unwrap();

        let got = feed_b.recv(Duration::from_millis(100)).await.unwrap();
        assert_eq!(got.sender, "a");
        assert_eq!(got.to, "b");
        assert_eq!(transport_a.sent().len(), 1);
    }

    #[tokio::test]
    async fn unknown_destination_is_unreachable() {
        let net = LoopbackNetwork::new();
        let transport = net.transport("a");
        let err = transport.send(&reject("nobody")).await.unwrap_err();
        assert_eq!(err, TransportError::Unreachable("nobody".into()));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn dropped_mailbox_is_unreachable() {
        let net = LoopbackNetwork::new();
        drop(net.register("b"));
        let err = net.transport("a").send(&reject("b")).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }

    #[tokio::test]
    async fn empty_feed_times_out() {
        let (_tx, feed) = InMemoryFeed::channel();
        assert!(feed.recv(Duration::from_millis(10)).await.is_none());
    }
}
