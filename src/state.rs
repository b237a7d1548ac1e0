//! Connection state and entity binding cells.
//!
//! Both cells have a single writer, the connection manager. Every other
//! component holds a clone and only reads. Writes are `pub(crate)` so
//! application code cannot move the state machine behind the client's back.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::entity::EntityId;

/// Lifecycle state of the real-time connection.
///
/// ```text
/// Disconnected --connect()--> Connecting --(transport open)--> Connected
/// Connected --(staleness or transport error)--> Reconnecting
/// Reconnecting --(success)--> Connected
/// Reconnecting --(max attempts exceeded)--> Disconnected
/// Connected|Reconnecting --disconnect()--> Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Initial and terminal state.
    Disconnected,
    /// `connect` is opening the transport.
    Connecting,
    /// Transport open and standard subscriptions established.
    Connected,
    /// Automatic recovery in progress.
    Reconnecting,
}

impl ConnectionState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Reconnecting => 3,
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Shared, lock-free cell holding the current [`ConnectionState`].
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl Default for StateCell {
    fn default() -> Self {
        Self(Arc::new(AtomicU8::new(ConnectionState::Disconnected.to_u8())))
    }
}

impl StateCell {
    /// Current state.
    #[must_use]
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Replaces the state, returning the previous one.
    pub(crate) fn set(&self, next: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(next.to_u8(), Ordering::AcqRel))
    }

    /// Moves to `next` only if the current state is `expected`.
    pub(crate) fn transition(&self, expected: ConnectionState, next: ConnectionState) -> bool {
        self.0
            .compare_exchange(expected.to_u8(), next.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Shorthand for `get() == Connected`.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.get() == ConnectionState::Connected
    }
}

/// The entity the standard subscriptions are currently bound to.
#[derive(Debug, Clone, Default)]
pub struct EntityBinding(Arc<RwLock<Option<EntityId>>>);

impl EntityBinding {
    /// Currently bound entity, if any.
    #[must_use]
    pub fn get(&self) -> Option<EntityId> {
        self.0.read().clone()
    }

    /// Returns true if `owner` names the bound entity.
    ///
    /// With no binding every owner matches.
    #[must_use]
    pub fn matches(&self, owner: &str) -> bool {
        self.0.read().as_ref().map_or(true, |bound| bound.as_str() == owner)
    }

    pub(crate) fn bind(&self, entity: EntityId) {
        *self.0.write() = Some(entity);
    }

    pub(crate) fn clear(&self) -> Option<EntityId> {
        self.0.write().take()
    }
}
