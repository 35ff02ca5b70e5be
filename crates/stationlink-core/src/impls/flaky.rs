//! Fault-injecting transport wrapper.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use crate::domain::OutboundMessage;
use crate::ports::{Transport, TransportError};

/// Fails the first `failures` sends with `error`, then delegates to `inner`.
pub struct FlakyTransport<T> {
    inner: T,
    error: TransportError,
    remaining_failures: AtomicU32,
    attempts: AtomicU32,
}

impl<T: Transport> FlakyTransport<T> {
    pub fn new(inner: T, failures: u32, error: TransportError) -> Self {
        Self {
            inner,
            error,
            remaining_failures: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        }
    }

    /// Never succeeds.
    pub fn always_failing(inner: T, error: TransportError) -> Self {
        Self::new(inner, u32::MAX, error)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: Transport> Transport for FlakyTransport<T> {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(self.error.clone());
        }
        self.inner.send(message).await
    }
}
