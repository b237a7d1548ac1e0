//! Typed client event bus.
//!
//! Connection health and subscription changes are announced as
//! [`ClientEvent`]s. Observers either register synchronous listeners for an
//! [`EventKind`] (`on`/`off`) or consume an async stream of every event.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::channel::ChannelSet;
use crate::entity::EntityId;
use crate::error::SyncError;

/// Buffered events per stream observer before the slowest one starts lagging.
const STREAM_CAPACITY: usize = 256;

/// Why a reconnect was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectReason {
    /// No inbound activity for longer than the stale threshold.
    Stale,
    /// The transport reported an error or closed.
    TransportLost {
        /// Transport-supplied description.
        message: String,
    },
    /// A previous attempt failed and the next one is being scheduled.
    RetryAfterFailure,
}

/// Why the client settled into `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    Requested,
    /// `pause()` was called.
    Paused,
    /// `connect()` could not open the transport.
    ConnectFailed,
    /// Automatic recovery gave up.
    ReconnectExhausted,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "client disconnected",
            Self::Paused => "client paused",
            Self::ConnectFailed => "connect failed",
            Self::ReconnectExhausted => "reconnect attempts exhausted",
        };
        f.write_str(s)
    }
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Transport open, entity bound, standard subscriptions established.
    Connected {
        /// The bound entity.
        entity_id: EntityId,
    },
    /// The client is now `Disconnected`.
    Disconnected {
        /// What caused it.
        reason: DisconnectReason,
    },
    /// An automatic reconnect attempt was scheduled.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Wait before the attempt fires.
        delay: Duration,
        /// What triggered recovery.
        reason: ReconnectReason,
    },
    /// A failure surfaced from a timer, dispatch or API path.
    Error(SyncError),
    /// An inbound message was routed to at least one subscription.
    Message {
        /// Channels the message was published on.
        channels: Vec<String>,
    },
    /// A channel set was registered with the transport.
    Subscribed {
        /// The registered set.
        channels: ChannelSet,
    },
    /// A channel set was torn down.
    Unsubscribed {
        /// The removed set.
        channels: ChannelSet,
    },
    /// `subscribe_to_entity` attached callbacks.
    EntitySubscribed {
        /// The entity the callbacks filter on.
        entity_id: EntityId,
        /// Number of named data callbacks registered.
        subscription_count: usize,
    },
}

impl ClientEvent {
    /// Discriminant of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Connected { .. } => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::Reconnecting { .. } => EventKind::Reconnecting,
            Self::Error(_) => EventKind::Error,
            Self::Message { .. } => EventKind::Message,
            Self::Subscribed { .. } => EventKind::Subscribed,
            Self::Unsubscribed { .. } => EventKind::Unsubscribed,
            Self::EntitySubscribed { .. } => EventKind::EntitySubscribed,
        }
    }
}

/// Event categories listeners register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum EventKind {
    Connected,
    Disconnected,
    Reconnecting,
    Error,
    Message,
    Subscribed,
    Unsubscribed,
    EntitySubscribed,
}

/// Handle returned by [`EventBus::on`], used to detach the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// A synchronous event listener.
pub type Listener = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

struct ListenerEntry {
    id: ListenerId,
    kind: Option<EventKind>,
    listener: Listener,
}

/// Fan-out of [`ClientEvent`]s to listeners and streams.
pub struct EventBus {
    listeners: RwLock<Vec<ListenerEntry>>,
    stream_tx: broadcast::Sender<ClientEvent>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("streams", &self.stream_tx.receiver_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        let (stream_tx, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            listeners: RwLock::new(Vec::new()),
            stream_tx,
        }
    }

    /// Registers `listener` for events of `kind`.
    pub fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&ClientEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.insert(Some(kind), Arc::new(listener))
    }

    /// Registers `listener` for every event.
    pub fn on_any(&self, listener: impl Fn(&ClientEvent) + Send + Sync + 'static) -> ListenerId {
        self.insert(None, Arc::new(listener))
    }

    fn insert(&self, kind: Option<EventKind>, listener: Listener) -> ListenerId {
        let id = ListenerId::new();
        self.listeners.write().push(ListenerEntry { id, kind, listener });
        id
    }

    /// Detaches a listener. Returns false if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }

    /// Number of attached listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Delivers `event` to matching listeners, then to streams.
    ///
    /// Listeners run outside the registration lock, so they may call `on` and
    /// `off` themselves. A panicking listener is logged and skipped.
    pub fn emit(&self, event: ClientEvent) {
        let kind = event.kind();
        let targets: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .filter(|entry| entry.kind.map_or(true, |k| k == kind))
            .map(|entry| Arc::clone(&entry.listener))
            .collect();

        for listener in targets {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::warn!(?kind, "event listener panicked");
            }
        }

        // No stream observers is not an error.
        let _ = self.stream_tx.send(event);
    }

    /// Async stream of every event emitted from now on.
    #[must_use]
    pub fn stream(&self) -> BroadcastStream<ClientEvent> {
        BroadcastStream::new(self.stream_tx.subscribe())
    }
}
