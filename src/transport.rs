//! Real-time transport boundary.
//!
//! The backend's event stream is an external collaborator. The client only
//! needs to open and close one multiplexed connection and to register or
//! drop channel sets on it; every inbound frame for every registration is
//! pushed into a single ordered [`SignalSink`].
//!
//! [`LoopbackTransport`] is an in-process implementation with failure
//! injection, used by tests, benchmarks and the demo binary.

use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::channel::{ChannelKey, ChannelSet};
use crate::error::TransportError;
use crate::message::InboundEvent;

/// Something the transport reports to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    /// A raw inbound message (JSON text).
    Message(String),
    /// The link failed; the transport is no longer usable.
    Error {
        /// Transport-supplied description.
        message: String,
    },
    /// The remote side closed the link.
    Closed {
        /// Close reason, if any.
        reason: Option<String>,
    },
}

/// Ordered queue the transport pushes signals into.
pub type SignalSink = mpsc::UnboundedSender<TransportSignal>;

/// Transport-level registration handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportHandle(u64);

impl TransportHandle {
    /// Wraps a raw handle value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw handle value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The external real-time transport.
///
/// `open` and `close` are the suspension points of the client. Registrations
/// are scoped to one open connection: after `close` (or a link failure) every
/// handle is dead and must be re-issued.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Opens the connection; inbound signals go to `sink` until closed.
    async fn open(&self, sink: SignalSink) -> Result<(), TransportError>;

    /// Closes the connection. Closing a closed transport is not an error.
    async fn close(&self) -> Result<(), TransportError>;

    /// Registers a channel set on the open connection.
    fn subscribe(&self, channels: &ChannelSet) -> Result<TransportHandle, TransportError>;

    /// Drops a registration.
    fn unsubscribe(&self, handle: TransportHandle) -> Result<(), TransportError>;
}

#[derive(Debug, Default)]
struct LoopbackState {
    open: bool,
    sink: Option<SignalSink>,
    next_handle: u64,
    registrations: HashMap<TransportHandle, ChannelSet>,
    failing_opens: u32,
    always_fail_open: bool,
    failing_subscribes: HashSet<ChannelKey>,
    fail_unsubscribes: bool,
    open_calls: u32,
    close_calls: u32,
    subscribe_calls: u32,
    unsubscribe_calls: u32,
}

/// In-process transport with failure injection.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
}

impl LoopbackTransport {
    /// Creates a closed loopback transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls to `open` fail.
    pub fn fail_next_opens(&self, n: u32) {
        self.state.lock().failing_opens = n;
    }

    /// Every call to `open` fails while set.
    pub fn set_open_failing(&self, failing: bool) {
        self.state.lock().always_fail_open = failing;
    }

    /// Registrations of exactly `channels` are rejected.
    pub fn fail_subscribe_for(&self, channels: &ChannelSet) {
        self.state.lock().failing_subscribes.insert(channels.key());
    }

    /// Every `unsubscribe` call fails while set.
    pub fn set_unsubscribe_failing(&self, failing: bool) {
        self.state.lock().fail_unsubscribes = failing;
    }

    /// Clears every injected failure.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failing_opens = 0;
        state.always_fail_open = false;
        state.failing_subscribes.clear();
        state.fail_unsubscribes = false;
    }

    /// Publishes `payload` on `channel`.
    ///
    /// Returns false if the transport is closed or nothing is registered on
    /// that channel.
    pub fn publish(&self, channel: &str, payload: Value) -> bool {
        let event = InboundEvent::new(channel, payload);
        match event.to_raw() {
            Ok(raw) => self.deliver(channel, raw),
            Err(_) => false,
        }
    }

    /// Pushes raw text as if it arrived on `channel`.
    pub fn publish_raw(&self, channel: &str, raw: impl Into<String>) -> bool {
        self.deliver(channel, raw.into())
    }

    fn deliver(&self, channel: &str, raw: String) -> bool {
        let state = self.state.lock();
        if !state.open || !state.registrations.values().any(|set| set.contains(channel)) {
            return false;
        }
        state
            .sink
            .as_ref()
            .is_some_and(|sink| sink.send(TransportSignal::Message(raw)).is_ok())
    }

    /// Simulates an unexpected link failure.
    pub fn drop_connection(&self, message: impl Into<String>) {
        let mut state = self.state.lock();
        state.open = false;
        state.registrations.clear();
        if let Some(sink) = state.sink.take() {
            let _ = sink.send(TransportSignal::Error {
                message: message.into(),
            });
        }
    }

    /// Returns true while the connection is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Live registrations on the current connection.
    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.state.lock().registrations.len()
    }

    /// Number of `open` calls, successful or not.
    #[must_use]
    pub fn open_calls(&self) -> u32 {
        self.state.lock().open_calls
    }

    /// Number of `close` calls.
    #[must_use]
    pub fn close_calls(&self) -> u32 {
        self.state.lock().close_calls
    }

    /// Number of `subscribe` calls, successful or not.
    #[must_use]
    pub fn subscribe_calls(&self) -> u32 {
        self.state.lock().subscribe_calls
    }

    /// Number of `unsubscribe` calls, successful or not.
    #[must_use]
    pub fn unsubscribe_calls(&self) -> u32 {
        self.state.lock().unsubscribe_calls
    }
}

#[async_trait]
impl RealtimeTransport for LoopbackTransport {
    async fn open(&self, sink: SignalSink) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.open_calls += 1;
        if state.always_fail_open || state.failing_opens > 0 {
            state.failing_opens = state.failing_opens.saturating_sub(1);
            return Err(TransportError::ConnectionFailed {
                message: "loopback open refused".to_string(),
            });
        }
        state.open = true;
        state.sink = Some(sink);
        state.registrations.clear();
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.close_calls += 1;
        state.open = false;
        state.sink = None;
        state.registrations.clear();
        Ok(())
    }

    fn subscribe(&self, channels: &ChannelSet) -> Result<TransportHandle, TransportError> {
        let mut state = self.state.lock();
        state.subscribe_calls += 1;
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        if state.failing_subscribes.contains(&channels.key()) {
            return Err(TransportError::SubscribeRejected {
                channels: channels.to_string(),
                message: "loopback subscribe refused".to_string(),
            });
        }
        state.next_handle += 1;
        let handle = TransportHandle::new(state.next_handle);
        state.registrations.insert(handle, channels.clone());
        Ok(handle)
    }

    fn unsubscribe(&self, handle: TransportHandle) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.unsubscribe_calls += 1;
        if state.fail_unsubscribes {
            return Err(TransportError::UnsubscribeFailed {
                message: format!("loopback unsubscribe of {handle} refused"),
            });
        }
        state.registrations.remove(&handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn set(c: &str) -> ChannelSet {
        ChannelSet::single(c).unwrap()
    }

    #[tokio::test]
    async fn test_publish_requires_open_and_registration() {
        let transport = LoopbackTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(!transport.publish("a", json!({})));

        transport.open(tx).await.unwrap();
        assert!(!transport.publish("a", json!({})));

        transport.subscribe(&set("a")).unwrap();
        assert!(transport.publish("a", json!({"n": 1})));
        match rx.recv().await.unwrap() {
            TransportSignal::Message(raw) => {
                let ev = InboundEvent::parse(&raw).unwrap();
                assert_eq!(ev.payload, json!({"n": 1}));
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_drops_registrations() {
        let transport = LoopbackTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.open(tx).await.unwrap();
        transport.subscribe(&set("a")).unwrap();
        assert_eq!(transport.registration_count(), 1);

        transport.close().await.unwrap();
        assert!(!transport.is_open());
        assert_eq!(transport.registration_count(), 0);
        assert_eq!(transport.subscribe(&set("a")), Err(TransportError::NotOpen));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let transport = LoopbackTransport::new();
        transport.fail_next_opens(1);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(transport.open(tx.clone()).await.is_err());
        transport.open(tx).await.unwrap();
        assert_eq!(transport.open_calls(), 2);

        transport.fail_subscribe_for(&set("bad"));
        assert!(matches!(
            transport.subscribe(&set("bad")),
            Err(TransportError::SubscribeRejected { .. })
        ));
        let h = transport.subscribe(&set("good")).unwrap();

        transport.set_unsubscribe_failing(true);
        assert!(transport.unsubscribe(h).is_err());
        transport.clear_failures();
        transport.unsubscribe(h).unwrap();
        assert_eq!(transport.unsubscribe_calls(), 2);
    }

    #[tokio::test]
    async fn test_drop_connection_signals_error() {
        let transport = LoopbackTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.open(tx).await.unwrap();
        transport.drop_connection("reset by peer");
        assert!(!transport.is_open());
        assert_eq!(
            rx.recv().await,
            Some(TransportSignal::Error {
                message: "reset by peer".to_string()
            })
        );
    }
}
