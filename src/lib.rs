//! # realtime-sync - Real-time synchronization client
//!
//! Keeps one live event-subscription connection to a backend event stream,
//! multiplexes logical subscriptions over it, detects stale links and
//! recovers with bounded exponential backoff.
//!
//! ## Components
//!
//! - **Connection Manager** ([`ConnectionManager`]): lifecycle state machine and public API
//! - **Subscription Registry** ([`SubscriptionRegistry`]): one transport registration per
//!   channel set
//! - **Event Router** ([`EventRouter`]): ordered dispatch with ownership filtering and
//!   failure isolation
//! - **Heartbeat Monitor** ([`HeartbeatMonitor`]): staleness detection from inbound silence
//! - **Reconnect Scheduler** ([`ReconnectScheduler`]): single-flight exponential backoff
//! - **Activity Logger** ([`ActivityLogger`]): side-effect log for login and setting changes
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use realtime_sync::{
//!     ClientConfig, ConnectionManager, EntityCallbacks, LoopbackTransport, TracingActivityLogger,
//! };
//!
//! let client = ConnectionManager::new(
//!     ClientConfig::default(),
//!     Arc::new(LoopbackTransport::new()),
//!     Arc::new(TracingActivityLogger),
//! )?;
//!
//! client.connect("user-42").await?;
//! let teardown = client.subscribe_to_entity(
//!     "user-42",
//!     EntityCallbacks::new().on_transaction_update(|tx| {
//!         println!("{tx}");
//!         Ok(())
//!     }),
//! )?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod channel;
pub mod config;
pub mod entity;
pub mod error;
pub mod events;
pub mod message;
pub mod state;

// Collaborators
pub mod activity;
pub mod transport;

// Client components
pub mod client;
pub mod heartbeat;
pub mod reconnect;
pub mod registry;
pub mod router;

pub use activity::{
    ActivityCategory, ActivityEntry, ActivityError, ActivityLogger, MemoryActivityLogger,
    QueueActivityLogger, TracingActivityLogger,
};
pub use channel::{ChannelKey, ChannelSet, StandardChannel};
pub use client::{ConnectionManager, EntityCallback, EntityCallbacks, EntityTeardown};
pub use config::{ChannelLayout, ClientConfig, HeartbeatConfig, ReconnectPolicy};
pub use entity::EntityId;
pub use error::{
    CallbackError, ErrorKind, SyncError, SyncResult, TransportError, ValidationError,
};
pub use events::{ClientEvent, DisconnectReason, EventBus, EventKind, ListenerId, ReconnectReason};
pub use heartbeat::HeartbeatMonitor;
pub use message::InboundEvent;
pub use reconnect::{ReconnectScheduler, ReconnectTarget, ReopenOutcome, TriggerOutcome};
pub use registry::{CallbackResult, Disposer, MessageCallback, SubscriptionId, SubscriptionRegistry};
pub use router::{DispatchOutcome, EventRouter};
pub use state::{ConnectionState, EntityBinding, StateCell};
pub use transport::{
    LoopbackTransport, RealtimeTransport, SignalSink, TransportHandle, TransportSignal,
};
